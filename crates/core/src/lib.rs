pub mod config;
pub mod events;
pub mod handler;
pub mod mempool;
pub mod scanner;
pub mod shutdown;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export commonly used types
pub use config::{MempoolConfig, ScannerConfig};
pub use events::{EventPublisher, ScanEvent, ScannerStatus};
pub use handler::{ChannelHandler, HandlerChain, LoggingHandler};
pub use mempool::{InsertOutcome, MempoolTracker, PendingSet, PollSummary};
pub use scanner::{BlockScanner, Cursor, ForkCheck, ForkResolution, ForkResolver, RetryPolicy};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
