use thiserror::Error;

/// Errors reported by a block or mempool source.
///
/// The split matters to every caller: transient errors are retried in place,
/// fatal errors abort whatever operation issued the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Data exists but is not available yet (not propagated, node warming up,
    /// empty response). Retry the same request.
    #[error("Source data not yet available, must retry: {0}")]
    Transient(String),

    /// Malformed input, permanent RPC failure or anything else that needs an
    /// operator.
    #[error("Source request failed: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Ledger store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record under key {0}")]
    Corruption(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
}

/// Errors surfaced by the block scanner and the mempool tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Contract violation on a block handed to the scanner, e.g. an empty
    /// height string.
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Fork point not found within {depth} ancestors of {from}")]
    ForkTooDeep { depth: usize, from: String },

    #[error("Fork resolution failed, scanner must be restarted: {0}")]
    ForkResolution(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Stop requested")]
    Stopped,

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ScanError {
    /// Terminal errors end the scan loop; everything else only aborts the
    /// current iteration.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidBlock(_)
                | ScanError::ForkTooDeep { .. }
                | ScanError::ForkResolution(_)
                | ScanError::TaskFailed(_)
        )
    }
}

/// Result type alias for convenience
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
