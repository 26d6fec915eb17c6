pub mod adaptive;
pub mod change;
pub mod checkpoint;
pub mod compress;
pub mod conflict;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod observe;
pub mod protocol;
pub mod retry;
pub mod revision;
pub mod server;
pub mod store;
pub mod transport;
pub mod vclock;

pub use adaptive::{AdaptiveSettings, NetworkSignals, SyncProfile};
pub use change::{ChangeEvent, ChangeRecord, Document, Operation};
pub use checkpoint::CheckpointSnapshot;
pub use config::{SyncConfig, SyncConfigBuilder, SyncDirection};
pub use conflict::{Resolution, Strategy, Winner};
pub use engine::{SyncEngine, SyncHandle};
pub use error::{Result, SyncError};
pub use observe::{SyncStats, SyncStatus};
pub use protocol::{Envelope, MessageBody, PROTOCOL, VERSION};
pub use retry::{CircuitState, RetryEvent};
pub use server::LocalServer;
pub use store::{DocumentStore, MemoryStore, PersistedState};
pub use transport::{
    Dialer, EitherTransport, PollingTransport, StreamingTransport, TcpDialer, Transport,
    TransportEvent, TransportOptions,
};
pub use vclock::{Causality, VectorClock};
