use crate::adaptive::AdaptiveBounds;
use crate::conflict::{MergeFn, Strategy};
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    Push,
    Pull,
    #[default]
    Both,
}

impl SyncDirection {
    pub fn allows_push(self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Both)
    }

    pub fn allows_pull(self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Both)
    }
}

/// Frozen engine configuration. Built once through [`SyncConfigBuilder`] and
/// never mutated afterwards; unknown-field tolerance belongs to whatever
/// loads it, not here.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub node_id: String,
    pub server_url: String,
    pub auth_token: Option<String>,
    /// Collections to sync. `None` means every collection that has pending
    /// ledger entries or documents in the store.
    pub collections: Option<Vec<String>>,
    pub direction: SyncDirection,
    pub conflict_strategy: Strategy,
    pub auto_retry: bool,
    pub retry_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub use_streaming_transport: bool,
    /// Zero disables the periodic pull ticker.
    pub pull_interval_ms: u64,
    pub batch_size: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub enable_compression: bool,
    pub network_check_interval_ms: u64,
    pub power_save_threshold: f32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    pub request_timeout_ms: u64,
}

impl SyncConfig {
    pub fn builder(node_id: impl Into<String>, server_url: impl Into<String>) -> SyncConfigBuilder {
        SyncConfigBuilder::new(node_id, server_url)
    }

    /// Retention for synced ledger entries: matched to the circuit breaker's
    /// reset timeout.
    pub fn synced_retention(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            success_threshold: self.success_threshold,
            max_attempts: if self.auto_retry {
                self.max_retry_attempts.max(1)
            } else {
                1
            },
        }
    }

    pub fn adaptive_bounds(&self) -> AdaptiveBounds {
        AdaptiveBounds {
            min_batch: self.min_batch,
            max_batch: self.max_batch,
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            enable_compression: self.enable_compression,
            retry_base_delay: Duration::from_millis(self.retry_delay_ms),
            power_save_threshold: self.power_save_threshold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(SyncError::Config("node_id must not be empty".into()));
        }
        if self.server_url.is_empty() {
            return Err(SyncError::Config("server_url must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.min_batch == 0 || self.min_batch > self.max_batch {
            return Err(SyncError::Config(format!(
                "batch bounds invalid: min {} max {}",
                self.min_batch, self.max_batch
            )));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(SyncError::Config(format!(
                "interval bounds invalid: min {} max {}",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(SyncError::Config(
                "circuit thresholds must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.power_save_threshold) {
            return Err(SyncError::Config(
                "power_save_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config(
                "request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new(node_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        SyncConfigBuilder {
            config: SyncConfig {
                node_id: node_id.into(),
                server_url: server_url.into(),
                auth_token: None,
                collections: None,
                direction: SyncDirection::Both,
                conflict_strategy: Strategy::LastWriteWins,
                auto_retry: true,
                retry_delay_ms: 1000,
                max_retry_attempts: 5,
                use_streaming_transport: true,
                pull_interval_ms: 30_000,
                batch_size: 100,
                min_batch: 10,
                max_batch: 500,
                min_interval_ms: 5_000,
                max_interval_ms: 300_000,
                enable_compression: true,
                network_check_interval_ms: 10_000,
                power_save_threshold: 0.2,
                failure_threshold: 5,
                reset_timeout_ms: 30_000,
                success_threshold: 2,
                request_timeout_ms: 10_000,
            },
        }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn direction(mut self, direction: SyncDirection) -> Self {
        self.config.direction = direction;
        self
    }

    pub fn conflict_strategy(mut self, strategy: Strategy) -> Self {
        self.config.conflict_strategy = strategy;
        self
    }

    pub fn custom_merge(mut self, merge: Arc<MergeFn>) -> Self {
        self.config.conflict_strategy = Strategy::Custom(merge);
        self
    }

    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.config.auto_retry = enabled;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    pub fn use_streaming_transport(mut self, streaming: bool) -> Self {
        self.config.use_streaming_transport = streaming;
        self
    }

    pub fn pull_interval_ms(mut self, ms: u64) -> Self {
        self.config.pull_interval_ms = ms;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn batch_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_batch = min;
        self.config.max_batch = max;
        self
    }

    pub fn interval_bounds_ms(mut self, min: u64, max: u64) -> Self {
        self.config.min_interval_ms = min;
        self.config.max_interval_ms = max;
        self
    }

    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.config.enable_compression = enabled;
        self
    }

    pub fn network_check_interval_ms(mut self, ms: u64) -> Self {
        self.config.network_check_interval_ms = ms;
        self
    }

    pub fn power_save_threshold(mut self, threshold: f32) -> Self {
        self.config.power_save_threshold = threshold;
        self
    }

    pub fn circuit_breaker(mut self, failure_threshold: u32, reset_timeout_ms: u64, success_threshold: u32) -> Self {
        self.config.failure_threshold = failure_threshold;
        self.config.reset_timeout_ms = reset_timeout_ms;
        self.config.success_threshold = success_threshold;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
