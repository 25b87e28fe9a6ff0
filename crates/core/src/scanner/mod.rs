//! Fork-aware block scanner.
//!
//! The scanner walks heights one at a time, persisting every block together
//! with its transactions. When a block does not extend the trusted tip the
//! replaced range is re-flagged and the cursor rewinds to the fork point.

pub mod fork;
pub mod retry;

pub use fork::{ForkCheck, ForkResolution, ForkResolver};
pub use retry::RetryPolicy;

use crate::config::ScannerConfig;
use crate::events::{EventPublisher, ScanEvent, ScannerStatus};
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use chainscan_common::{
    BlockRecord, BlockSource, LedgerBatch, LedgerStore, ScanError, ScanResult, TransactionHandler,
    TransactionRecord,
};
use num_bigint::BigUint;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Position of the scan loop. Owned by the loop, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Trusted tip
    pub last_block: BlockRecord,
    /// Next height to fetch
    pub last_number: BigUint,
    /// Set when a fork was resolved; cleared by re-initialization
    pub fork_flag: bool,
}

impl Cursor {
    /// Resume after a stored block.
    pub fn after(block: BlockRecord) -> Self {
        Self {
            last_number: block.next_height(),
            last_block: block,
            fork_flag: false,
        }
    }

    /// Start at a block that has not been stored yet; it is fetched first.
    pub fn at(block: BlockRecord) -> Self {
        Self {
            last_number: block.height.clone(),
            last_block: block,
            fork_flag: false,
        }
    }
}

enum Iteration {
    Scanned,
    ForkResolved,
}

struct RunningScan {
    trigger: ShutdownTrigger,
    handle: JoinHandle<ScanResult<()>>,
}

/// Drives a `BlockSource` into a `LedgerStore`.
pub struct BlockScanner {
    source: Arc<dyn BlockSource>,
    store: Arc<dyn LedgerStore>,
    handler: Arc<dyn TransactionHandler>,
    config: ScannerConfig,
    events: EventPublisher,
    status: Arc<watch::Sender<ScannerStatus>>,
    running: Mutex<Option<RunningScan>>,
}

impl BlockScanner {
    pub fn new(
        source: Arc<dyn BlockSource>,
        store: Arc<dyn LedgerStore>,
        handler: Arc<dyn TransactionHandler>,
        config: ScannerConfig,
    ) -> Self {
        let (status, _) = watch::channel(ScannerStatus::Idle);
        Self {
            source,
            store,
            handler,
            events: EventPublisher::new(config.event_capacity),
            config,
            status: Arc::new(status),
            running: Mutex::new(None),
        }
    }

    /// Builds the cursor and spawns the scan loop. Initialization errors are
    /// returned and leave the scanner stopped.
    pub async fn start(&self) -> ScanResult<()> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return Err(ScanError::AlreadyRunning);
            }
        }
        if let Some(finished) = running.take() {
            if let Ok(Err(e)) = finished.handle.await {
                debug!("Discarding result of previous scan loop: {}", e);
            }
        }

        self.status.send_replace(ScannerStatus::Initializing);
        let cursor = match self.initialize().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("Scanner initialization failed: {}", e);
                self.status.send_replace(ScannerStatus::Failed(e.to_string()));
                return Err(e);
            }
        };

        info!(
            "Block scanner starting at height {} (tip {})",
            cursor.last_number, cursor.last_block.hash
        );

        let (trigger, signal) = shutdown_channel();
        let worker = ScanWorker {
            source: self.source.clone(),
            store: self.store.clone(),
            handler: self.handler.clone(),
            resolver: ForkResolver::new(
                self.source.clone(),
                self.store.clone(),
                RetryPolicy::new(self.config.retry_delay()),
                self.config.max_fork_depth,
            ),
            retry: RetryPolicy::new(self.config.retry_delay()),
            config: self.config.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            cursor,
            signal,
        };
        let handle = tokio::spawn(worker.run());
        *running = Some(RunningScan { trigger, handle });
        Ok(())
    }

    /// Requests a stop and waits for the loop to exit. Returns the loop's
    /// terminal error if it had already failed.
    pub async fn stop(&self) -> ScanResult<()> {
        let mut running = self.running.lock().await;
        let current = running.take().ok_or(ScanError::NotRunning)?;
        current.trigger.trigger();
        match current.handle.await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("scan loop panicked or was cancelled: {}", e);
                self.status.send_replace(ScannerStatus::Failed(reason.clone()));
                Err(ScanError::TaskFailed(reason))
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|current| !current.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn status(&self) -> ScannerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ScannerStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Resume from the most recent canonical block in the store, or bootstrap
    /// from the source when the store is empty. Source calls are made once;
    /// any error, transient or not, aborts `start()`.
    async fn initialize(&self) -> ScanResult<Cursor> {
        if let Some(block) = self.resume_point().await? {
            info!(
                "Resuming from stored block {} at height {} ({})",
                block.hash,
                block.height,
                block.datetime()
            );
            return Ok(Cursor::after(block));
        }

        let height = match self.config.start_height() {
            Some(height) => height,
            None => self.source.latest_height().await?,
        };
        let info = self.source.block_info(&height).await?;
        let block = BlockRecord::from_info(&info)?;

        info!("Ledger is empty, bootstrapping from height {}", block.height);
        Ok(Cursor::at(block))
    }

    /// Latest canonical block whose parent link is intact.
    ///
    /// A fork iteration stores the block that exposed the fork before the
    /// replacement branch below it is rescanned. If the loop stopped in
    /// between, that block's parent is missing; resuming after it would leave
    /// the branch unscanned, so step down to the canonical block below it.
    async fn resume_point(&self) -> ScanResult<Option<BlockRecord>> {
        let Some(mut block) = self.store.latest_canonical_block().await? else {
            return Ok(None);
        };
        while self.store.block_by_hash(&block.parent_hash).await?.is_none() {
            match self.store.latest_canonical_below(&block.height).await? {
                Some(below) => {
                    warn!(
                        "Stored block {} at height {} has no stored parent, rewinding to {} at height {}",
                        block.hash, block.height, below.hash, below.height
                    );
                    block = below;
                }
                // first block ever stored
                None => break,
            }
        }
        Ok(Some(block))
    }
}

struct ScanWorker {
    source: Arc<dyn BlockSource>,
    store: Arc<dyn LedgerStore>,
    handler: Arc<dyn TransactionHandler>,
    resolver: ForkResolver,
    retry: RetryPolicy,
    config: ScannerConfig,
    events: EventPublisher,
    status: Arc<watch::Sender<ScannerStatus>>,
    cursor: Cursor,
    signal: ShutdownSignal,
}

impl ScanWorker {
    async fn run(mut self) -> ScanResult<()> {
        self.status.send_replace(ScannerStatus::Scanning);

        loop {
            if self.cursor.fork_flag {
                self.status.send_replace(ScannerStatus::ForkHandling);
                self.reinitialize();
                self.status.send_replace(ScannerStatus::Scanning);
            }
            if self.signal.is_triggered() {
                break;
            }

            let snapshot = self.cursor.clone();
            match self.scan_next().await {
                Ok(Iteration::Scanned) => {
                    if !self.signal.sleep(self.config.scan_interval()).await {
                        break;
                    }
                }
                Ok(Iteration::ForkResolved) => {}
                Err(ScanError::Stopped) => break,
                Err(e) if e.is_terminal() => {
                    error!("Block scanner terminated at height {}: {}", snapshot.last_number, e);
                    self.status.send_replace(ScannerStatus::Failed(e.to_string()));
                    self.events.publish_terminated(Some(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!("Scan of height {} failed: {}", snapshot.last_number, e);
                    self.cursor = snapshot;
                    self.events
                        .publish_iteration_failed(&self.cursor.last_number, &e.to_string());
                    if !self.signal.sleep(self.config.error_backoff()).await {
                        break;
                    }
                }
            }
        }

        info!("Block scanner stopped at height {}", self.cursor.last_number);
        self.status.send_replace(ScannerStatus::Stopped);
        self.events.publish_terminated(None);
        Ok(())
    }

    /// Rebuilds the cursor from the fork point the resolver left as tip.
    fn reinitialize(&mut self) {
        self.cursor.last_number = self.cursor.last_block.next_height();
        self.cursor.fork_flag = false;
        info!(
            "Re-initialized after fork: tip {} at height {}, next height {}",
            self.cursor.last_block.hash, self.cursor.last_block.height, self.cursor.last_number
        );
    }

    async fn scan_next(&mut self) -> ScanResult<Iteration> {
        let target = self.cursor.last_number.clone();
        self.wait_for_height(&target).await?;

        let source = &self.source;
        let height = &target;
        let info = self
            .retry
            .run("block", &self.signal, || source.block_info(height))
            .await?;
        let fetched = BlockRecord::from_info(&info)?;
        if fetched.height != target {
            return Err(ScanError::InvalidBlock(format!(
                "requested height {} but source returned block {} at height {}",
                target, fetched.hash, fetched.height
            )));
        }

        self.cursor.last_number = &target + 1u32;

        let mut batch = LedgerBatch::new();
        let candidate = match self.store.block_by_hash(&fetched.hash).await? {
            Some(existing) => existing,
            None => {
                batch.stage_block(fetched.clone());
                fetched
            }
        };

        match ForkResolver::detect(&mut self.cursor.last_block, &candidate) {
            ForkCheck::Fork => {
                let resolution = self
                    .resolver
                    .resolve(&mut self.cursor.last_block, &candidate, &self.signal)
                    .await?;
                self.cursor.fork_flag = true;
                self.store.commit(batch).await?;

                self.events.publish(ScanEvent::ForkDetected {
                    height: candidate.height.clone(),
                    hash: candidate.hash.clone(),
                    fork_point_height: resolution.fork_point.height.clone(),
                    fork_point_hash: resolution.fork_point.hash.clone(),
                    flagged: resolution.flagged,
                    lookups: resolution.lookups,
                });
                Ok(Iteration::ForkResolved)
            }
            ForkCheck::NoFork => {
                let transactions: Vec<TransactionRecord> = info
                    .transactions
                    .iter()
                    .map(|tx| TransactionRecord::from_source(&candidate, tx))
                    .collect();
                batch.stage_transactions(transactions.iter().cloned());
                let summary = self.store.commit(batch).await?;

                debug!(
                    "Scanned block {} at height {} ({} transactions)",
                    candidate.hash,
                    candidate.height,
                    transactions.len()
                );

                let count = transactions.len();
                let handler = self.handler.clone();
                tokio::spawn(async move { handler.handle(transactions).await });

                self.events
                    .publish_block_scanned(&candidate.height, &candidate.hash, count, summary.block_inserted);
                Ok(Iteration::Scanned)
            }
        }
    }

    /// Returns once the source tip reaches `target`, polling every
    /// `catch_up_interval` while it lags.
    async fn wait_for_height(&self, target: &BigUint) -> ScanResult<()> {
        let source = &self.source;
        let latest = self
            .retry
            .run("chain tip", &self.signal, || source.latest_height())
            .await?;
        if latest >= *target {
            return Ok(());
        }

        debug!("Waiting for height {} (node at {})", target, latest);
        loop {
            if !self.signal.sleep(self.config.catch_up_interval()).await {
                return Err(ScanError::Stopped);
            }
            match self.source.latest_height().await {
                Ok(latest) if latest >= *target => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!("Chain tip lookup failed while waiting: {}", e),
            }
        }
    }
}
