//! Configuration for the feedback store and its background worker.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default sleep time between background drain cycles, in milliseconds.
pub const DEFAULT_NAPTIME_MS: u64 = 500;

/// Upper bound for the drain wake interval.
pub const MAX_NAPTIME_MS: u64 = 30_000;

/// Configuration for a [`FeedbackStore`](crate::FeedbackStore).
///
/// The node role (`in_recovery`) and the primary address are reloadable at
/// runtime; sessions pick their write path from the role once when opened,
/// and the background worker re-reads the configuration when it observes a
/// reload signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the store database file.
    pub path: PathBuf,
    /// Sleep time in milliseconds between background drain cycles.
    pub naptime_ms: u64,
    /// Address of the primary node ("host:port"), required on a replica.
    pub primary_addr: Option<String>,
    /// Whether this node is a read-only replica still in recovery.
    ///
    /// A replica never applies merges locally; staged mutations are
    /// forwarded to `primary_addr` instead.
    pub in_recovery: bool,
}

impl StoreConfig {
    /// Create a configuration for a store at `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            naptime_ms: DEFAULT_NAPTIME_MS,
            primary_addr: None,
            in_recovery: false,
        }
    }

    /// Set the drain wake interval.
    ///
    /// # Panics
    /// Panics if `naptime_ms` exceeds [`MAX_NAPTIME_MS`]. Zero is allowed
    /// and means the worker wakes immediately after each cycle.
    pub fn with_naptime_ms(mut self, naptime_ms: u64) -> Self {
        assert!(
            naptime_ms <= MAX_NAPTIME_MS,
            "naptime_ms must be between 0 and {}, got {}",
            MAX_NAPTIME_MS,
            naptime_ms
        );
        self.naptime_ms = naptime_ms;
        self
    }

    /// Set the primary node address used for replica-side forwarding.
    pub fn with_primary_addr(mut self, addr: impl Into<String>) -> Self {
        self.primary_addr = Some(addr.into());
        self
    }

    /// Mark this node as a replica in recovery.
    pub fn with_in_recovery(mut self, in_recovery: bool) -> Self {
        self.in_recovery = in_recovery;
        self
    }

    /// Validate field combinations that the builders cannot catch alone.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.in_recovery && self.primary_addr.is_none() {
            return Err(crate::error::KindlingError::config(
                "replica configuration requires a primary address",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/kindling.db");
        assert_eq!(config.naptime_ms, DEFAULT_NAPTIME_MS);
        assert!(!config.in_recovery);
        assert!(config.primary_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "naptime_ms must be between")]
    fn test_naptime_out_of_range() {
        let _ = StoreConfig::new("/tmp/kindling.db").with_naptime_ms(30_001);
    }

    #[test]
    fn test_replica_requires_primary() {
        let config = StoreConfig::new("/tmp/kindling.db").with_in_recovery(true);
        assert!(config.validate().is_err());

        let config = config.with_primary_addr("127.0.0.1:7433");
        assert!(config.validate().is_ok());
    }
}
