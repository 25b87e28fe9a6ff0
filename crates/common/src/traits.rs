use crate::error::{SourceError, StoreError};
use crate::types::{BlockInfo, BlockRecord, TransactionRecord};
use async_trait::async_trait;
use num_bigint::BigUint;

/// Read access to a chain backend. Implemented per node type; the scanner
/// never depends on a concrete client.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_height(&self) -> Result<BigUint, SourceError>;
    async fn block_info(&self, height: &BigUint) -> Result<BlockInfo, SourceError>;
    async fn parent_hash(&self, hash: &str) -> Result<String, SourceError>;
}

/// Read access to a node's pending-transaction set.
#[async_trait]
pub trait MempoolSource: Send + Sync {
    async fn pending_transactions(&self) -> Result<Vec<String>, SourceError>;
}

/// Downstream consumer of scanned transactions. Called once per committed
/// block; the scanner does not wait for it.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn handle(&self, transactions: Vec<TransactionRecord>);
}

/// Writes staged for one store transaction. Dropping a batch without
/// committing it is the rollback.
#[derive(Debug, Default, Clone)]
pub struct LedgerBatch {
    block: Option<BlockRecord>,
    transactions: Vec<TransactionRecord>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_block(&mut self, block: BlockRecord) {
        self.block = Some(block);
    }

    pub fn stage_transactions(&mut self, transactions: impl IntoIterator<Item = TransactionRecord>) {
        self.transactions.extend(transactions);
    }

    pub fn block(&self) -> Option<&BlockRecord> {
        self.block.as_ref()
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_none() && self.transactions.is_empty()
    }
}

/// What a commit actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// False when a block with the same hash was already stored.
    pub block_inserted: bool,
    pub transactions_written: usize,
}

/// Transactional persistence for block and transaction records.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError>;

    /// Most recent block with `is_fork == false`, ordered by creation time.
    async fn latest_canonical_block(&self) -> Result<Option<BlockRecord>, StoreError>;

    /// Highest block with `is_fork == false` and `height < below`.
    async fn latest_canonical_below(&self, below: &BigUint) -> Result<Option<BlockRecord>, StoreError>;

    /// Sets `is_fork` on every stored block with `above < height < below`,
    /// atomically. Returns the number of blocks in the range.
    async fn mark_fork_range(&self, above: &BigUint, below: &BigUint) -> Result<usize, StoreError>;

    /// Applies a batch atomically. A staged block whose hash is already
    /// stored is left untouched.
    async fn commit(&self, batch: LedgerBatch) -> Result<CommitSummary, StoreError>;
}
