use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Block scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Pause between two successfully scanned heights
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Poll interval while the node has not reached the next height
    #[serde(default = "default_catch_up_interval_ms")]
    pub catch_up_interval_ms: u64,

    /// Delay between attempts on transient source errors
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Pause after a failed iteration before retrying the same height
    #[serde(default = "default_scanner_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Maximum number of parent lookups while searching for a fork point
    #[serde(default = "default_max_fork_depth")]
    pub max_fork_depth: usize,

    /// Height to bootstrap from when the ledger is empty. Chain tip if unset.
    #[serde(default)]
    pub start_height: Option<u64>,

    /// Buffer size of the scan event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            catch_up_interval_ms: default_catch_up_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            error_backoff_ms: default_scanner_error_backoff_ms(),
            max_fork_depth: default_max_fork_depth(),
            start_height: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl ScannerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn catch_up_interval(&self) -> Duration {
        Duration::from_millis(self.catch_up_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn start_height(&self) -> Option<BigUint> {
        self.start_height.map(BigUint::from)
    }
}

/// Mempool tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    #[serde(default = "default_mempool_enabled")]
    pub enabled: bool,

    /// Maximum number of tracked transaction hashes
    #[serde(default = "default_mempool_capacity")]
    pub capacity: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_mempool_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            enabled: default_mempool_enabled(),
            capacity: default_mempool_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_mempool_error_backoff_ms(),
        }
    }
}

impl MempoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

// Default values
fn default_scan_interval_ms() -> u64 { 1_000 }
fn default_catch_up_interval_ms() -> u64 { 4_000 }
fn default_retry_delay_ms() -> u64 { 500 }
fn default_scanner_error_backoff_ms() -> u64 { 4_000 }
fn default_max_fork_depth() -> usize { 1_000 }
fn default_event_capacity() -> usize { 1_024 }
fn default_mempool_enabled() -> bool { true }
fn default_mempool_capacity() -> usize { 500 }
fn default_poll_interval_ms() -> u64 { 10_000 }
fn default_mempool_error_backoff_ms() -> u64 { 5_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
        assert_eq!(config.catch_up_interval(), Duration::from_secs(4));
        assert_eq!(config.max_fork_depth, 1000);
        assert!(config.start_height().is_none());
    }

    #[test]
    fn test_mempool_defaults() {
        let config = MempoolConfig::default();
        assert!(config.enabled);
        assert_eq!(config.capacity, 500);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.error_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ScannerConfig =
            serde_json::from_str(r#"{"max_fork_depth": 16, "start_height": 840000}"#).unwrap();
        assert_eq!(config.max_fork_depth, 16);
        assert_eq!(config.start_height(), Some(BigUint::from(840_000u32)));
        assert_eq!(config.retry_delay_ms, 500);
    }
}
