//! Shared data model, collaborator traits and utilities for chainscan.

pub mod error;
pub mod traits;
pub mod types;
pub mod utils;

pub use error::{ConfigError, ScanError, ScanResult, SourceError, StoreError};
pub use traits::{BlockSource, CommitSummary, LedgerBatch, LedgerStore, MempoolSource, TransactionHandler};
pub use types::{BlockInfo, BlockRecord, SourceTransaction, TransactionRecord};
