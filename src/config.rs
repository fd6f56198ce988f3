//! Engine Configuration
//!
//! A single [`EngineConfig`] value is built at startup and shared (behind an `Arc`)
//! by every component of a node. Defaults describe a small 4+2 cluster; each field
//! can be overridden from an `EC_*` environment variable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Largest stripe the GF(2^8) coding matrix supports.
pub const MAX_STRIPE_WIDTH: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of data chunks per stripe (k).
    pub data_chunks: usize,
    /// Number of parity chunks per stripe (m).
    pub parity_chunks: usize,
    /// Capacity of every chunk in bytes.
    pub chunk_size: u32,
    /// An open chunk is sealed once its free space drops below this many bytes.
    pub flush_threshold: u32,
    /// Open chunks kept per data chunk buffer.
    pub open_slots: usize,
    /// Number of stripe lists the placement spreads keys over.
    pub list_count: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub priority_queue_capacity: usize,
    /// Lease of an in-flight correlation entry before the reaper fails it.
    pub pending_lease_ms: u64,
    pub reap_interval_ms: u64,
    pub client_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub failure_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_chunks: 4,
            parity_chunks: 2,
            chunk_size: 4096,
            flush_threshold: 64,
            open_slots: 4,
            list_count: 16,
            worker_count: 4,
            queue_capacity: 4096,
            priority_queue_capacity: 256,
            pending_lease_ms: 10_000,
            reap_interval_ms: 1_000,
            client_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            failure_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Configuration for a stripe of `k` data and `m` parity chunks, other fields defaulted.
    pub fn new(data_chunks: usize, parity_chunks: usize) -> Self {
        Self {
            data_chunks,
            parity_chunks,
            ..Self::default()
        }
    }

    pub fn stripe_width(&self) -> usize {
        self.data_chunks + self.parity_chunks
    }

    pub fn pending_lease(&self) -> Duration {
        Duration::from_millis(self.pending_lease_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_chunks == 0 {
            return Err(EngineError::InvalidConfig(
                "data_chunks must be greater than 0".into(),
            ));
        }
        if self.parity_chunks == 0 {
            return Err(EngineError::InvalidConfig(
                "parity_chunks must be greater than 0".into(),
            ));
        }
        if self.stripe_width() > MAX_STRIPE_WIDTH {
            return Err(EngineError::InvalidConfig(format!(
                "stripe width {} exceeds {}",
                self.stripe_width(),
                MAX_STRIPE_WIDTH
            )));
        }
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidConfig(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if self.flush_threshold >= self.chunk_size {
            return Err(EngineError::InvalidConfig(
                "flush_threshold must be smaller than chunk_size".into(),
            ));
        }
        if self.open_slots == 0 || self.list_count == 0 || self.worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "open_slots, list_count and worker_count must be greater than 0".into(),
            ));
        }
        if self.queue_capacity == 0 || self.priority_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue capacities must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by any parseable `EC_*` environment variable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        override_from_env("EC_DATA_CHUNKS", &mut config.data_chunks);
        override_from_env("EC_PARITY_CHUNKS", &mut config.parity_chunks);
        override_from_env("EC_CHUNK_SIZE", &mut config.chunk_size);
        override_from_env("EC_FLUSH_THRESHOLD", &mut config.flush_threshold);
        override_from_env("EC_OPEN_SLOTS", &mut config.open_slots);
        override_from_env("EC_LIST_COUNT", &mut config.list_count);
        override_from_env("EC_WORKER_COUNT", &mut config.worker_count);
        override_from_env("EC_QUEUE_CAPACITY", &mut config.queue_capacity);
        override_from_env(
            "EC_PRIORITY_QUEUE_CAPACITY",
            &mut config.priority_queue_capacity,
        );
        override_from_env("EC_PENDING_LEASE_MS", &mut config.pending_lease_ms);
        override_from_env("EC_REAP_INTERVAL_MS", &mut config.reap_interval_ms);
        override_from_env("EC_CLIENT_TIMEOUT_MS", &mut config.client_timeout_ms);
        override_from_env("EC_HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms);
        override_from_env("EC_FAILURE_TIMEOUT_MS", &mut config.failure_timeout_ms);
        config
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}
