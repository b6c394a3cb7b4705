//! Engine configuration.
//!
//! All limits that bound memory and latency on the ingress path live here.
//! The configuration can be built in code with the `with_*` setters or
//! loaded from a JSON file where every field is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default cap on buffered, not-yet-carved bytes per flow direction (8 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Default number of requests awaiting a response on one flow.
pub const DEFAULT_MAX_PENDING_PER_FLOW: usize = 32;

/// Default rule cache capacity.
pub const DEFAULT_RULE_CACHE_CAPACITY: usize = 8192;

/// Default rule cache inactivity timeout (4 hours).
pub const DEFAULT_RULE_CACHE_TTL_SECS: u64 = 4 * 60 * 60;

/// Default size at which bodies are offloaded to the blob store (64 KiB).
pub const DEFAULT_BLOB_THRESHOLD_BYTES: usize = 64 * 1024;

/// Default number of de-duplication keys remembered.
pub const DEFAULT_DEDUP_CAPACITY: usize = 65_536;

/// Default cap on collected body bytes per message (4 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Configuration for [`crate::InterceptEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum unparsed bytes held for one (flow, side) before the buffer
    /// is dropped and reset.
    pub max_buffer_bytes: usize,
    /// Maximum requests queued per flow while awaiting responses.
    pub max_pending_per_flow: usize,
    /// Maximum entries in the rule lookup cache.
    pub rule_cache_capacity: usize,
    /// Inactivity timeout for rule cache entries, in seconds.
    pub rule_cache_ttl_secs: u64,
    /// Bodies at or above this size are stored in the blob store.
    pub blob_threshold_bytes: usize,
    /// Maximum de-duplication keys before the set is cleared.
    pub dedup_capacity: usize,
    /// Keep request bodies on reconstructed records.
    pub collect_request_body: bool,
    /// Keep response bodies on reconstructed records.
    pub collect_response_body: bool,
    /// Maximum body bytes kept per message; longer bodies are truncated.
    pub max_body_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_pending_per_flow: DEFAULT_MAX_PENDING_PER_FLOW,
            rule_cache_capacity: DEFAULT_RULE_CACHE_CAPACITY,
            rule_cache_ttl_secs: DEFAULT_RULE_CACHE_TTL_SECS,
            blob_threshold_bytes: DEFAULT_BLOB_THRESHOLD_BYTES,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            collect_request_body: true,
            collect_response_body: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_bytes == 0 {
            return Err(EngineError::Config(
                "max_buffer_bytes must be greater than zero".into(),
            ));
        }
        if self.max_pending_per_flow == 0 {
            return Err(EngineError::Config(
                "max_pending_per_flow must be greater than zero".into(),
            ));
        }
        if self.rule_cache_capacity == 0 {
            return Err(EngineError::Config(
                "rule_cache_capacity must be greater than zero".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(EngineError::Config(
                "dedup_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Returns the rule cache inactivity timeout.
    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }

    /// Sets the per-direction buffer cap.
    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Sets the per-flow pending request cap.
    pub fn with_max_pending_per_flow(mut self, count: usize) -> Self {
        self.max_pending_per_flow = count;
        self
    }

    /// Sets the rule cache capacity and inactivity timeout.
    pub fn with_rule_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.rule_cache_capacity = capacity;
        self.rule_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the blob offload threshold.
    pub fn with_blob_threshold(mut self, bytes: usize) -> Self {
        self.blob_threshold_bytes = bytes;
        self
    }

    /// Sets the de-duplication capacity.
    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Sets which bodies are kept on records.
    pub fn with_body_collection(mut self, request: bool, response: bool) -> Self {
        self.collect_request_body = request;
        self.collect_response_body = response;
        self
    }

    /// Sets the per-message body cap.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}
