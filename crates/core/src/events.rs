//! Scanner status and event publication.

use num_bigint::BigUint;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle of a block scanner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScannerStatus {
    #[default]
    Idle,
    /// Building the cursor from the ledger or the chain tip
    Initializing,
    Scanning,
    /// Rebuilding the cursor after a reorganization
    ForkHandling,
    Stopped,
    /// The loop ended on an error that needs a restart
    Failed(String),
}

impl fmt::Display for ScannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerStatus::Idle => write!(f, "idle"),
            ScannerStatus::Initializing => write!(f, "initializing"),
            ScannerStatus::Scanning => write!(f, "scanning"),
            ScannerStatus::ForkHandling => write!(f, "fork-handling"),
            ScannerStatus::Stopped => write!(f, "stopped"),
            ScannerStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Events emitted by the scan loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A non-diverging block and its transactions were committed
    BlockScanned {
        height: BigUint,
        hash: String,
        transactions: usize,
        /// False when the block row already existed
        inserted: bool,
    },
    /// A reorganization was detected and the replaced range re-flagged
    ForkDetected {
        height: BigUint,
        hash: String,
        fork_point_height: BigUint,
        fork_point_hash: String,
        flagged: usize,
        lookups: usize,
    },
    /// An iteration was aborted; the same height is retried after a backoff
    IterationFailed { height: BigUint, error: String },
    /// The loop exited, with the terminal error if any
    Terminated { error: Option<String> },
}

/// Event publisher for scan events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Publish event to all subscribers
    pub fn publish(&self, event: ScanEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("No subscribers to receive event: {:?}", e.0);
        }
    }

    pub fn publish_block_scanned(&self, height: &BigUint, hash: &str, transactions: usize, inserted: bool) {
        self.publish(ScanEvent::BlockScanned {
            height: height.clone(),
            hash: hash.to_string(),
            transactions,
            inserted,
        });
    }

    pub fn publish_iteration_failed(&self, height: &BigUint, error: &str) {
        self.publish(ScanEvent::IterationFailed {
            height: height.clone(),
            error: error.to_string(),
        });
    }

    pub fn publish_terminated(&self, error: Option<String>) {
        self.publish(ScanEvent::Terminated { error });
    }

    /// Get receiver count (active subscribers)
    pub fn active_subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
