//! In-memory collaborators for tests and local experiments.
//!
//! `ScriptedChain` plays the node (blocks, parent lookups, mempool) and
//! `MemoryLedger` plays the store. Both support failure injection.

use crate::config::ScannerConfig;
use crate::events::ScanEvent;
use async_trait::async_trait;
use chainscan_common::{
    BlockInfo, BlockRecord, BlockSource, CommitSummary, LedgerBatch, LedgerStore, MempoolSource,
    SourceError, SourceTransaction, StoreError, TransactionRecord,
};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const GENESIS_TIME: i64 = 1_600_000_000;
const BLOCK_TIME: i64 = 600;
const TXS_PER_BLOCK: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ChainState {
    /// Height of `blocks[0]`
    base: u64,
    blocks: Vec<BlockInfo>,
    /// Every block ever produced, including replaced ones: hash -> parent
    parents: HashMap<String, String>,
    pending: Vec<String>,
    block_failures: VecDeque<SourceError>,
    parent_failures: VecDeque<SourceError>,
    pending_failures: VecDeque<SourceError>,
}

impl ChainState {
    fn next_height(&self) -> u64 {
        self.base + self.blocks.len() as u64
    }

    fn tip_hash(&self, branch: &str) -> String {
        match self.blocks.last() {
            Some(block) => block.hash.clone(),
            None if self.base == 0 => String::new(),
            None => ScriptedChain::hash_for(branch, self.base - 1),
        }
    }

    fn push(&mut self, info: BlockInfo) {
        self.parents.insert(info.hash.clone(), info.parent_hash.clone());
        self.blocks.push(info);
    }
}

/// A scriptable chain implementing `BlockSource` and `MempoolSource`.
#[derive(Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    parent_lookups: AtomicUsize,
    block_fetches: AtomicUsize,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` blocks of `branch` at heights `0..count`.
    pub fn with_blocks(branch: &str, count: u64) -> Self {
        Self::with_blocks_from(branch, 0, count)
    }

    /// `count` blocks of `branch` starting at height `start`.
    pub fn with_blocks_from(branch: &str, start: u64, count: u64) -> Self {
        let chain = Self::new();
        lock(&chain.state).base = start;
        chain.extend(branch, count);
        chain
    }

    pub fn hash_for(branch: &str, height: u64) -> String {
        format!("{}{:06}", branch, height)
    }

    fn make_block(branch: &str, height: u64, parent_hash: String) -> BlockInfo {
        let hash = Self::hash_for(branch, height);
        let timestamp = GENESIS_TIME + height as i64 * BLOCK_TIME;
        let transactions = (0..TXS_PER_BLOCK)
            .map(|i| SourceTransaction {
                tx_id: format!("{}:{}", hash, i),
                tx_hash: format!("{}:{}w", hash, i),
                vin_size: 1,
                vout_size: 2,
                pack_time: timestamp,
            })
            .collect();
        BlockInfo {
            hash,
            parent_hash,
            height: height.to_string(),
            timestamp: timestamp.to_string(),
            transactions,
        }
    }

    fn grow(state: &mut ChainState, branch: &str, count: u64) {
        for _ in 0..count {
            let height = state.next_height();
            let parent = state.tip_hash(branch);
            state.push(Self::make_block(branch, height, parent));
        }
    }

    /// Appends `count` blocks of `branch` on top of the current tip.
    pub fn extend(&self, branch: &str, count: u64) {
        Self::grow(&mut lock(&self.state), branch, count);
    }

    /// Drops every block at or above `from_height` and grows `branch` from
    /// there with `count` blocks, in one step.
    pub fn reorg(&self, from_height: u64, branch: &str, count: u64) {
        let mut state = lock(&self.state);
        let keep = from_height.saturating_sub(state.base) as usize;
        state.blocks.truncate(keep);
        Self::grow(&mut state, branch, count);
    }

    /// Appends a hand-made block, e.g. one with a malformed height.
    pub fn push_raw_block(&self, hash: &str, parent_hash: &str, height: &str) {
        let mut state = lock(&self.state);
        state.push(BlockInfo {
            hash: hash.to_string(),
            parent_hash: parent_hash.to_string(),
            height: height.to_string(),
            timestamp: GENESIS_TIME.to_string(),
            transactions: Vec::new(),
        });
    }

    pub fn block_at(&self, height: u64) -> Option<BlockInfo> {
        let state = lock(&self.state);
        let index = height.checked_sub(state.base)? as usize;
        state.blocks.get(index).cloned()
    }

    pub fn set_pending(&self, hashes: Vec<String>) {
        lock(&self.state).pending = hashes;
    }

    /// Errors returned by the next `block_info` calls, in order.
    pub fn fail_block_fetches(&self, errors: Vec<SourceError>) {
        lock(&self.state).block_failures.extend(errors);
    }

    pub fn fail_parent_lookups(&self, errors: Vec<SourceError>) {
        lock(&self.state).parent_failures.extend(errors);
    }

    pub fn fail_pending(&self, errors: Vec<SourceError>) {
        lock(&self.state).pending_failures.extend(errors);
    }

    pub fn parent_lookups(&self) -> usize {
        self.parent_lookups.load(Ordering::SeqCst)
    }

    pub fn block_fetches(&self) -> usize {
        self.block_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockSource for ScriptedChain {
    async fn latest_height(&self) -> Result<BigUint, SourceError> {
        let state = lock(&self.state);
        match state.next_height().checked_sub(1) {
            Some(height) if !state.blocks.is_empty() => Ok(BigUint::from(height)),
            _ => Err(SourceError::Transient("chain is empty".into())),
        }
    }

    async fn block_info(&self, height: &BigUint) -> Result<BlockInfo, SourceError> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(err) = state.block_failures.pop_front() {
            return Err(err);
        }
        height
            .to_u64()
            .and_then(|h| h.checked_sub(state.base))
            .and_then(|index| state.blocks.get(index as usize).cloned())
            .ok_or_else(|| SourceError::Transient(format!("block {} is empty", height)))
    }

    async fn parent_hash(&self, hash: &str) -> Result<String, SourceError> {
        self.parent_lookups.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(err) = state.parent_failures.pop_front() {
            return Err(err);
        }
        state
            .parents
            .get(hash)
            .cloned()
            .ok_or_else(|| SourceError::Fatal(format!("unknown block {}", hash)))
    }
}

#[async_trait]
impl MempoolSource for ScriptedChain {
    async fn pending_transactions(&self) -> Result<Vec<String>, SourceError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.pending_failures.pop_front() {
            return Err(err);
        }
        Ok(state.pending.clone())
    }
}

#[derive(Default)]
struct LedgerState {
    blocks: HashMap<String, BlockRecord>,
    transactions: BTreeMap<(String, String), TransactionRecord>,
}

/// `LedgerStore` kept in memory.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    next_id: AtomicU64,
    commit_failure: Mutex<Option<StoreError>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stores a block directly, bypassing the batch path.
    pub fn insert_block(&self, mut block: BlockRecord) {
        if block.id == 0 {
            block.id = self.assign_id();
        }
        lock(&self.state).blocks.insert(block.hash.clone(), block);
    }

    /// Makes the next `commit` fail with `error` without writing anything.
    pub fn fail_next_commit(&self, error: StoreError) {
        *lock(&self.commit_failure) = Some(error);
    }

    pub fn block(&self, hash: &str) -> Option<BlockRecord> {
        lock(&self.state).blocks.get(hash).cloned()
    }

    pub fn block_count(&self) -> usize {
        lock(&self.state).blocks.len()
    }

    /// All blocks ordered by height.
    pub fn blocks(&self) -> Vec<BlockRecord> {
        let mut blocks: Vec<BlockRecord> = lock(&self.state).blocks.values().cloned().collect();
        blocks.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.hash.cmp(&b.hash)));
        blocks
    }

    /// Non-fork blocks ordered by height.
    pub fn canonical_chain(&self) -> Vec<BlockRecord> {
        self.blocks().into_iter().filter(|b| !b.is_fork).collect()
    }

    pub fn transactions_for(&self, block_hash: &str) -> Vec<TransactionRecord> {
        lock(&self.state)
            .transactions
            .values()
            .filter(|tx| tx.block_hash == block_hash)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError> {
        Ok(self.block(hash))
    }

    async fn latest_canonical_block(&self) -> Result<Option<BlockRecord>, StoreError> {
        Ok(lock(&self.state)
            .blocks
            .values()
            .filter(|b| !b.is_fork)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.height.cmp(&b.height))
            })
            .cloned())
    }

    async fn latest_canonical_below(&self, below: &BigUint) -> Result<Option<BlockRecord>, StoreError> {
        Ok(lock(&self.state)
            .blocks
            .values()
            .filter(|b| !b.is_fork && &b.height < below)
            .max_by(|a, b| a.height.cmp(&b.height).then_with(|| a.created_at.cmp(&b.created_at)))
            .cloned())
    }

    async fn mark_fork_range(&self, above: &BigUint, below: &BigUint) -> Result<usize, StoreError> {
        let mut state = lock(&self.state);
        let mut flagged = Vec::new();
        for block in state.blocks.values_mut() {
            if &block.height > above && &block.height < below {
                block.is_fork = true;
                flagged.push(block.hash.clone());
            }
        }
        for tx in state.transactions.values_mut() {
            if flagged.contains(&tx.block_hash) {
                tx.is_fork = true;
            }
        }
        Ok(flagged.len())
    }

    async fn commit(&self, batch: LedgerBatch) -> Result<CommitSummary, StoreError> {
        if let Some(err) = lock(&self.commit_failure).take() {
            return Err(err);
        }

        let mut summary = CommitSummary::default();
        let mut state = lock(&self.state);
        if let Some(block) = batch.block() {
            if !state.blocks.contains_key(&block.hash) {
                let mut block = block.clone();
                block.id = self.assign_id();
                state.blocks.insert(block.hash.clone(), block);
                summary.block_inserted = true;
            }
        }
        for tx in batch.transactions() {
            let key = (tx.block_hash.clone(), tx.tx_id.clone());
            if !state.transactions.contains_key(&key) {
                let mut tx = tx.clone();
                tx.id = self.assign_id();
                state.transactions.insert(key, tx);
                summary.transactions_written += 1;
            }
        }
        Ok(summary)
    }
}

/// Scanner settings with millisecond waits.
pub fn fast_scanner_config() -> ScannerConfig {
    ScannerConfig {
        scan_interval_ms: 1,
        catch_up_interval_ms: 5,
        retry_delay_ms: 1,
        error_backoff_ms: 5,
        ..Default::default()
    }
}

/// Receives events until one matches `predicate`. Panics after five seconds.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ScanEvent>, predicate: F) -> ScanEvent
where
    F: Fn(&ScanEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("scan event channel closed"),
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for scan event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_chain_links_blocks() {
        let chain = ScriptedChain::with_blocks_from("a", 10, 3);
        assert_eq!(chain.latest_height().await.unwrap(), BigUint::from(12u32));

        let info = chain.block_info(&BigUint::from(11u32)).await.unwrap();
        assert_eq!(info.parent_hash, ScriptedChain::hash_for("a", 10));
        assert_eq!(info.transactions.len(), TXS_PER_BLOCK);
        assert_eq!(
            chain.parent_hash(&info.hash).await.unwrap(),
            ScriptedChain::hash_for("a", 10)
        );

        let missing = chain.block_info(&BigUint::from(13u32)).await.unwrap_err();
        assert!(missing.is_transient());
    }

    #[tokio::test]
    async fn test_reorg_replaces_suffix() {
        let chain = ScriptedChain::with_blocks("a", 5);
        chain.reorg(3, "b", 3);

        assert_eq!(chain.latest_height().await.unwrap(), BigUint::from(5u32));
        assert_eq!(chain.block_at(2).unwrap().hash, ScriptedChain::hash_for("a", 2));
        let b3 = chain.block_at(3).unwrap();
        assert_eq!(b3.hash, ScriptedChain::hash_for("b", 3));
        assert_eq!(b3.parent_hash, ScriptedChain::hash_for("a", 2));
        // replaced blocks stay resolvable
        assert!(chain.parent_hash(&ScriptedChain::hash_for("a", 4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_ledger_commit_failure_is_one_shot() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_commit(StoreError::Backend("disk full".into()));

        let mut batch = LedgerBatch::new();
        batch.stage_block(BlockRecord {
            hash: "h1".into(),
            ..Default::default()
        });
        assert!(ledger.commit(batch.clone()).await.is_err());
        assert_eq!(ledger.block_count(), 0);

        assert!(ledger.commit(batch).await.unwrap().block_inserted);
        assert_eq!(ledger.block_count(), 1);
    }
}
