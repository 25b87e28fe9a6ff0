//! Sled-backed ledger for scanned blocks and transactions.

pub mod ledger;

pub use ledger::{SledLedger, StorageConfig};
