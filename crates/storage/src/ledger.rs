use anyhow::{Context, Result};
use async_trait::async_trait;
use chainscan_common::traits::{CommitSummary, LedgerBatch, LedgerStore};
use chainscan_common::types::{BlockRecord, TransactionRecord};
use chainscan_common::utils::codec;
use chainscan_common::utils::db_keys::{
    block_hash_to_db_key, created_index_key, hash_from_created_index, hash_from_height_index,
    height_index_key, height_key, tx_key, tx_prefix,
};
use chainscan_common::StoreError;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use sled::{Transactional, Tree};
use std::path::PathBuf;
use tracing::{debug, info};

const BLOCKS_TREE: &str = "blocks";
const HEIGHTS_TREE: &str = "heights";
const CREATED_TREE: &str = "created";
const TRANSACTIONS_TREE: &str = "transactions";

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Page cache size in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_path() -> PathBuf { PathBuf::from("data/chainscan") }
fn default_cache_capacity() -> u64 { 64 * 1024 * 1024 }

/// Block and transaction ledger on top of sled.
///
/// Trees:
/// - `blocks`: hash -> block record
/// - `heights`: height ‖ hash -> ()
/// - `created`: created_at ‖ height ‖ hash -> ()
/// - `transactions`: block hash ‖ '#' ‖ tx id -> transaction record
#[derive(Clone)]
pub struct SledLedger {
    db: sled::Db,
    blocks: Tree,
    heights: Tree,
    created: Tree,
    transactions: Tree,
}

impl SledLedger {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .open()
            .with_context(|| format!("Failed to open ledger at {}", config.path.display()))?;
        let ledger = Self::from_db(db)?;
        info!(
            "Ledger opened at {} ({} blocks)",
            config.path.display(),
            ledger.blocks.len()
        );
        Ok(ledger)
    }

    /// Create a ledger from an existing sled::Db
    pub fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            blocks: db.open_tree(BLOCKS_TREE).context("Failed to open blocks tree")?,
            heights: db.open_tree(HEIGHTS_TREE).context("Failed to open heights tree")?,
            created: db.open_tree(CREATED_TREE).context("Failed to open created tree")?,
            transactions: db
                .open_tree(TRANSACTIONS_TREE)
                .context("Failed to open transactions tree")?,
            db,
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Every stored block at `height`, canonical or not.
    pub async fn blocks_at_height(&self, height: &BigUint) -> Result<Vec<BlockRecord>, StoreError> {
        let ledger = self.clone();
        let prefix = height_key(height)?;
        run_blocking(move || {
            let mut records = Vec::new();
            for entry in ledger.heights.scan_prefix(&prefix) {
                let (key, _) = entry.map_err(backend)?;
                let hash = hash_from_height_index(&key)
                    .ok_or_else(|| StoreError::Corruption(String::from_utf8_lossy(&key).into_owned()))?;
                if let Some(record) = ledger.read_block(&hash)? {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
    }

    pub async fn transactions_for_block(&self, block_hash: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let transactions = self.transactions.clone();
        let prefix = tx_prefix(block_hash);
        run_blocking(move || {
            transactions
                .scan_prefix(&prefix)
                .map(|entry| {
                    let (key, value) = entry.map_err(backend)?;
                    decode(&key, &value)
                })
                .collect()
        })
        .await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await.map(|_| ()).map_err(backend)
    }

    fn read_block(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError> {
        let key = block_hash_to_db_key(hash);
        match self.blocks.get(&key).map_err(backend)? {
            Some(value) => decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    fn commit_sync(&self, batch: &LedgerBatch) -> Result<CommitSummary, StoreError> {
        let block = match batch.block() {
            Some(block) => {
                let mut block = block.clone();
                block.id = self.db.generate_id().map_err(backend)?;
                let value = encode(&block)?;
                let height_entry = height_index_key(&block.height, &block.hash)?;
                let created_entry = created_index_key(block.created_at, &block.height, &block.hash)?;
                Some((block, value, height_entry, created_entry))
            }
            None => None,
        };

        let mut transactions = Vec::with_capacity(batch.transactions().len());
        for tx in batch.transactions() {
            let mut tx = tx.clone();
            tx.id = self.db.generate_id().map_err(backend)?;
            transactions.push((tx_key(&tx.block_hash, &tx.tx_id), encode(&tx)?));
        }

        let result = (&self.blocks, &self.heights, &self.created, &self.transactions).transaction(
            |(blocks, heights, created, txs)| -> ConflictableTransactionResult<CommitSummary, StoreError> {
                let mut summary = CommitSummary::default();

                if let Some((block, value, height_entry, created_entry)) = &block {
                    let key = block_hash_to_db_key(&block.hash);
                    if blocks.get(&key)?.is_none() {
                        blocks.insert(key, value.as_slice())?;
                        heights.insert(height_entry.as_slice(), &[] as &[u8])?;
                        created.insert(created_entry.as_slice(), &[] as &[u8])?;
                        summary.block_inserted = true;
                    }
                }

                for (key, value) in &transactions {
                    if txs.get(key)?.is_none() {
                        txs.insert(key.as_slice(), value.as_slice())?;
                        summary.transactions_written += 1;
                    }
                }

                Ok(summary)
            },
        );

        let summary = result.map_err(transaction_error)?;
        debug!(
            "Ledger commit: block_inserted={} transactions_written={}",
            summary.block_inserted, summary.transactions_written
        );
        Ok(summary)
    }

    fn latest_canonical_sync(&self) -> Result<Option<BlockRecord>, StoreError> {
        for entry in self.created.iter().rev() {
            let (key, _) = entry.map_err(backend)?;
            let hash = hash_from_created_index(&key)
                .ok_or_else(|| StoreError::Corruption(String::from_utf8_lossy(&key).into_owned()))?;
            match self.read_block(&hash)? {
                Some(record) if !record.is_fork => return Ok(Some(record)),
                Some(_) => continue,
                None => return Err(StoreError::Corruption(hash)),
            }
        }
        Ok(None)
    }

    fn latest_canonical_below_sync(&self, below: &BigUint) -> Result<Option<BlockRecord>, StoreError> {
        for entry in self.heights.range(..height_key(below)?).rev() {
            let (key, _) = entry.map_err(backend)?;
            let hash = hash_from_height_index(&key)
                .ok_or_else(|| StoreError::Corruption(String::from_utf8_lossy(&key).into_owned()))?;
            match self.read_block(&hash)? {
                Some(record) if !record.is_fork => return Ok(Some(record)),
                Some(_) => continue,
                None => return Err(StoreError::Corruption(hash)),
            }
        }
        Ok(None)
    }

    fn mark_fork_range_sync(&self, above: &BigUint, below: &BigUint) -> Result<usize, StoreError> {
        let first = above + 1u32;
        if &first >= below {
            return Ok(0);
        }

        let mut hashes = Vec::new();
        for entry in self.heights.range(height_key(&first)?..height_key(below)?) {
            let (key, _) = entry.map_err(backend)?;
            let hash = hash_from_height_index(&key)
                .ok_or_else(|| StoreError::Corruption(String::from_utf8_lossy(&key).into_owned()))?;
            hashes.push(hash);
        }

        let mut tx_keys = Vec::new();
        for hash in &hashes {
            for entry in self.transactions.scan_prefix(tx_prefix(hash)) {
                let (key, _) = entry.map_err(backend)?;
                tx_keys.push(key.to_vec());
            }
        }

        (&self.blocks, &self.transactions)
            .transaction(|(blocks, txs)| -> ConflictableTransactionResult<(), StoreError> {
                for hash in &hashes {
                    let key = block_hash_to_db_key(hash);
                    flag_fork::<BlockRecord, _>(blocks, &key, |record| record.is_fork = true)?;
                }
                for key in &tx_keys {
                    flag_fork::<TransactionRecord, _>(txs, key, |record| record.is_fork = true)?;
                }
                Ok(())
            })
            .map_err(transaction_error)?;

        Ok(hashes.len())
    }
}

#[async_trait]
impl LedgerStore for SledLedger {
    async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError> {
        let ledger = self.clone();
        let hash = hash.to_string();
        run_blocking(move || ledger.read_block(&hash)).await
    }

    async fn latest_canonical_block(&self) -> Result<Option<BlockRecord>, StoreError> {
        let ledger = self.clone();
        run_blocking(move || ledger.latest_canonical_sync()).await
    }

    async fn latest_canonical_below(&self, below: &BigUint) -> Result<Option<BlockRecord>, StoreError> {
        let ledger = self.clone();
        let below = below.clone();
        run_blocking(move || ledger.latest_canonical_below_sync(&below)).await
    }

    async fn mark_fork_range(&self, above: &BigUint, below: &BigUint) -> Result<usize, StoreError> {
        let ledger = self.clone();
        let above = above.clone();
        let below = below.clone();
        run_blocking(move || ledger.mark_fork_range_sync(&above, &below)).await
    }

    async fn commit(&self, batch: LedgerBatch) -> Result<CommitSummary, StoreError> {
        if batch.is_empty() {
            return Ok(CommitSummary::default());
        }
        let ledger = self.clone();
        run_blocking(move || ledger.commit_sync(&batch)).await
    }
}

/// Rewrites a stored record in place inside a transaction.
fn flag_fork<T, F>(
    tree: &TransactionalTree,
    key: &[u8],
    update: F,
) -> Result<(), ConflictableTransactionError<StoreError>>
where
    T: Serialize + serde::de::DeserializeOwned,
    F: Fn(&mut T),
{
    let Some(value) = tree.get(key)? else {
        return Ok(());
    };
    let mut record: T = decode(key, &value).map_err(ConflictableTransactionError::Abort)?;
    update(&mut record);
    let value = encode(&record).map_err(ConflictableTransactionError::Abort)?;
    tree.insert(key, value)?;
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("Blocking storage task failed: {}", e)))?
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    codec::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(key: &[u8], value: &[u8]) -> Result<T, StoreError> {
    codec::deserialize(value).map_err(|e| {
        StoreError::Corruption(format!("{} ({})", String::from_utf8_lossy(key), e))
    })
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn transaction_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::TransactionAborted(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_common::types::SourceTransaction;
    use tempfile::TempDir;

    fn open_ledger(dir: &TempDir) -> SledLedger {
        SledLedger::open(&StorageConfig {
            path: dir.path().join("ledger"),
            ..Default::default()
        })
        .unwrap()
    }

    fn block(height: u64, hash: &str, parent: &str, created_at: i64) -> BlockRecord {
        BlockRecord {
            id: 0,
            height: BigUint::from(height),
            hash: hash.to_string(),
            parent_hash: parent.to_string(),
            created_at,
            is_fork: false,
        }
    }

    fn tx(block: &BlockRecord, tx_id: &str) -> TransactionRecord {
        TransactionRecord::from_source(
            block,
            &SourceTransaction {
                tx_id: tx_id.to_string(),
                tx_hash: tx_id.to_string(),
                vin_size: 1,
                vout_size: 2,
                pack_time: block.created_at,
            },
        )
    }

    async fn commit_block(ledger: &SledLedger, record: &BlockRecord, tx_ids: &[&str]) -> CommitSummary {
        let mut batch = LedgerBatch::new();
        batch.stage_block(record.clone());
        batch.stage_transactions(tx_ids.iter().map(|id| tx(record, id)));
        ledger.commit(batch).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let b1 = block(1, "h1", "h0", 100);
        let summary = commit_block(&ledger, &b1, &["t1", "t2"]).await;
        assert!(summary.block_inserted);
        assert_eq!(summary.transactions_written, 2);

        let stored = ledger.block_by_hash("h1").await.unwrap().unwrap();
        assert_ne!(stored.id, 0);
        assert_eq!(stored.height, BigUint::from(1u32));
        assert_eq!(ledger.transactions_for_block("h1").await.unwrap().len(), 2);
        assert!(ledger.block_by_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_not_reinserted() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let b1 = block(1, "h1", "h0", 100);
        commit_block(&ledger, &b1, &["t1"]).await;
        let first_id = ledger.block_by_hash("h1").await.unwrap().unwrap().id;

        let summary = commit_block(&ledger, &b1, &["t1", "t2"]).await;
        assert!(!summary.block_inserted);
        assert_eq!(summary.transactions_written, 1);
        assert_eq!(ledger.block_by_hash("h1").await.unwrap().unwrap().id, first_id);
        assert_eq!(ledger.block_count(), 1);
    }

    #[tokio::test]
    async fn test_latest_canonical_skips_forks() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        assert!(ledger.latest_canonical_block().await.unwrap().is_none());

        commit_block(&ledger, &block(1, "h1", "h0", 100), &[]).await;
        commit_block(&ledger, &block(2, "h2", "h1", 200), &[]).await;
        commit_block(&ledger, &block(3, "h3", "h2", 300), &[]).await;
        assert_eq!(ledger.latest_canonical_block().await.unwrap().unwrap().hash, "h3");

        assert_eq!(ledger.mark_fork_range(&BigUint::from(1u32), &BigUint::from(4u32)).await.unwrap(), 2);
        assert_eq!(ledger.latest_canonical_block().await.unwrap().unwrap().hash, "h1");
    }

    #[tokio::test]
    async fn test_latest_canonical_below_skips_forks_and_higher_blocks() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        assert!(ledger.latest_canonical_below(&BigUint::from(5u32)).await.unwrap().is_none());

        commit_block(&ledger, &block(1, "a1", "a0", 100), &[]).await;
        commit_block(&ledger, &block(2, "a2", "a1", 200), &[]).await;
        commit_block(&ledger, &block(3, "a3", "a2", 300), &[]).await;
        ledger.mark_fork_range(&BigUint::from(1u32), &BigUint::from(4u32)).await.unwrap();
        commit_block(&ledger, &block(3, "b3", "b2", 400), &[]).await;

        let below = |h: u32| {
            let ledger = ledger.clone();
            async move { ledger.latest_canonical_below(&BigUint::from(h)).await.unwrap().map(|b| b.hash) }
        };
        assert_eq!(below(3).await.as_deref(), Some("a1"));
        assert_eq!(below(4).await.as_deref(), Some("b3"));
        assert_eq!(below(1).await, None);
    }

    #[tokio::test]
    async fn test_same_timestamp_falls_back_to_height() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        commit_block(&ledger, &block(10, "b", "a", 500), &[]).await;
        commit_block(&ledger, &block(9, "a", "z", 500), &[]).await;
        assert_eq!(ledger.latest_canonical_block().await.unwrap().unwrap().hash, "b");
    }

    #[tokio::test]
    async fn test_mark_fork_range_is_exclusive_and_flags_transactions() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        for h in 1..=5u64 {
            let record = block(h, &format!("h{}", h), &format!("h{}", h - 1), h as i64 * 10);
            commit_block(&ledger, &record, &["t"]).await;
        }

        let flagged = ledger
            .mark_fork_range(&BigUint::from(2u32), &BigUint::from(5u32))
            .await
            .unwrap();
        assert_eq!(flagged, 2);

        for (hash, expected) in [("h1", false), ("h2", false), ("h3", true), ("h4", true), ("h5", false)] {
            let record = ledger.block_by_hash(hash).await.unwrap().unwrap();
            assert_eq!(record.is_fork, expected, "block {}", hash);
            let txs = ledger.transactions_for_block(hash).await.unwrap();
            assert!(txs.iter().all(|t| t.is_fork == expected), "transactions of {}", hash);
        }
    }

    #[tokio::test]
    async fn test_mark_fork_range_empty_range() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        commit_block(&ledger, &block(1, "h1", "h0", 100), &[]).await;

        let two = BigUint::from(2u32);
        assert_eq!(ledger.mark_fork_range(&two, &BigUint::from(3u32)).await.unwrap(), 0);
        assert_eq!(ledger.mark_fork_range(&two, &two).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocks_at_height_lists_competitors() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        commit_block(&ledger, &block(7, "a7", "a6", 70), &[]).await;
        commit_block(&ledger, &block(7, "b7", "a6", 71), &[]).await;
        commit_block(&ledger, &block(8, "a8", "a7", 80), &[]).await;

        let mut hashes: Vec<String> = ledger
            .blocks_at_height(&BigUint::from(7u32))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.hash)
            .collect();
        hashes.sort();
        assert_eq!(hashes, vec!["a7", "b7"]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = open_ledger(&dir);
            commit_block(&ledger, &block(1, "h1", "h0", 100), &["t1"]).await;
            ledger.flush().await.unwrap();
        }
        let ledger = open_ledger(&dir);
        assert_eq!(ledger.latest_canonical_block().await.unwrap().unwrap().hash, "h1");
        assert_eq!(ledger.transactions_for_block("h1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        assert_eq!(ledger.commit(LedgerBatch::new()).await.unwrap(), CommitSummary::default());
        assert_eq!(ledger.block_count(), 0);
    }
}
