use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Error taxonomy of the sync core. Variants carry enough context to pick a
/// reaction: transient kinds feed the retry monitor, fatal kinds stop the
/// engine until restarted.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("transport fatal: {0}")]
    TransportFatal(String),

    #[error("request {id} timed out after {after_ms} ms")]
    Timeout { id: u64, after_ms: u64 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server {
        code: String,
        message: String,
        retriable: bool,
    },

    #[error("circuit open")]
    CircuitOpen,

    #[error("store: {0}")]
    Store(String),

    #[error("store fatal: {0}")]
    StoreFatal(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("engine stopped")]
    Stopped,

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the retry monitor should budget another attempt for this
    /// failure. Serde errors count as protocol violations and are dropped
    /// rather than retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout { .. } | SyncError::Io(_) => true,
            SyncError::Store(_) => true,
            SyncError::Server { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Fatal errors stop the engine; it must be restarted manually.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::TransportFatal(_) | SyncError::StoreFatal(_) | SyncError::Config(_)
        )
    }
}
