//! Bounded mirror of a node's pending-transaction set.

use crate::config::MempoolConfig;
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use chainscan_common::{MempoolSource, ScanError, ScanResult, SourceError};
use dashmap::DashSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of offering a hash to the pending set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Already tracked; its position in the eviction order is unchanged
    AlreadyTracked,
    Inserted { evicted: Option<String> },
}

/// Insertion-ordered, de-duplicated set with FIFO eviction.
///
/// Membership reads go to the concurrent set only; the order queue is
/// touched by writers.
#[derive(Debug)]
pub struct PendingSet {
    capacity: usize,
    order: Mutex<VecDeque<String>>,
    members: DashSet<String>,
}

impl PendingSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            members: DashSet::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&self, hash: &str) -> InsertOutcome {
        if self.members.contains(hash) {
            return InsertOutcome::AlreadyTracked;
        }

        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if self.members.contains(hash) {
            return InsertOutcome::AlreadyTracked;
        }

        let evicted = if order.len() >= self.capacity {
            order.pop_front().map(|oldest| {
                self.members.remove(&oldest);
                oldest
            })
        } else {
            None
        };

        order.push_back(hash.to_string());
        self.members.insert(hash.to_string());
        InsertOutcome::Inserted { evicted }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.members.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Tracked hashes, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.iter().cloned().collect()
    }
}

/// Counters for one poll of the source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub evicted: usize,
}

struct RunningPoll {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

/// Polls a `MempoolSource` in the background and answers membership queries.
pub struct MempoolTracker {
    source: Arc<dyn MempoolSource>,
    pending: Arc<PendingSet>,
    config: MempoolConfig,
    running: AsyncMutex<Option<RunningPoll>>,
}

impl MempoolTracker {
    pub fn new(source: Arc<dyn MempoolSource>, config: MempoolConfig) -> Self {
        Self {
            source,
            pending: Arc::new(PendingSet::new(config.capacity)),
            config,
            running: AsyncMutex::new(None),
        }
    }

    pub fn is_pending(&self, tx_hash: &str) -> bool {
        self.pending.contains(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.pending.snapshot()
    }

    /// Shared handle to the pending set, for readers outliving the tracker.
    pub fn pending(&self) -> Arc<PendingSet> {
        self.pending.clone()
    }

    /// Fetches the node's pending hashes once and tracks the unseen ones.
    pub async fn poll_once(&self) -> Result<PollSummary, SourceError> {
        poll(self.source.as_ref(), &self.pending).await
    }

    pub async fn start(&self) -> ScanResult<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|current| !current.handle.is_finished()) {
            return Err(ScanError::AlreadyRunning);
        }

        let (trigger, signal) = shutdown_channel();
        let handle = tokio::spawn(poll_loop(
            self.source.clone(),
            self.pending.clone(),
            self.config.clone(),
            signal,
        ));
        info!(
            "Mempool tracker started (capacity {}, every {:?})",
            self.pending.capacity(),
            self.config.poll_interval()
        );
        *running = Some(RunningPoll { trigger, handle });
        Ok(())
    }

    pub async fn stop(&self) -> ScanResult<()> {
        let mut running = self.running.lock().await;
        let current = running.take().ok_or(ScanError::NotRunning)?;
        current.trigger.trigger();
        current
            .handle
            .await
            .map_err(|e| ScanError::TaskFailed(format!("mempool loop panicked or was cancelled: {}", e)))
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
    }
}

async fn poll(source: &dyn MempoolSource, pending: &PendingSet) -> Result<PollSummary, SourceError> {
    let hashes = source.pending_transactions().await?;
    let mut summary = PollSummary {
        fetched: hashes.len(),
        ..Default::default()
    };
    for hash in &hashes {
        if let InsertOutcome::Inserted { evicted } = pending.insert(hash) {
            summary.inserted += 1;
            if evicted.is_some() {
                summary.evicted += 1;
            }
        }
    }
    Ok(summary)
}

async fn poll_loop(
    source: Arc<dyn MempoolSource>,
    pending: Arc<PendingSet>,
    config: MempoolConfig,
    signal: ShutdownSignal,
) {
    loop {
        let result = tokio::select! {
            result = poll(source.as_ref(), &pending) => result,
            _ = signal.triggered() => break,
        };

        let wait = match result {
            Ok(summary) => {
                debug!(
                    "Mempool poll: {} fetched, {} new, {} evicted, {} tracked",
                    summary.fetched,
                    summary.inserted,
                    summary.evicted,
                    pending.len()
                );
                config.poll_interval()
            }
            Err(e) => {
                warn!("Mempool poll failed: {}", e);
                config.error_backoff()
            }
        };

        if !signal.sleep(wait).await {
            break;
        }
    }
    info!("Mempool tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChain;
    use std::time::Duration;

    fn hashes(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
        range.map(|i| format!("h{}", i)).collect()
    }

    #[test]
    fn test_capacity_plus_one_evicts_oldest() {
        let set = PendingSet::new(3);
        for h in hashes(1..=3) {
            assert_eq!(set.insert(&h), InsertOutcome::Inserted { evicted: None });
        }
        assert_eq!(
            set.insert("h4"),
            InsertOutcome::Inserted {
                evicted: Some("h1".into())
            }
        );
        assert!(!set.contains("h1"));
        assert_eq!(set.snapshot(), hashes(2..=4));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_reinsert_does_not_refresh_order() {
        let set = PendingSet::new(3);
        for h in hashes(1..=3) {
            set.insert(&h);
        }
        assert_eq!(set.insert("h1"), InsertOutcome::AlreadyTracked);

        set.insert("h4");
        assert!(!set.contains("h1"));
        assert!(set.contains("h2"));
        assert_eq!(set.snapshot(), hashes(2..=4));
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let set = PendingSet::new(0);
        set.insert("a");
        set.insert("b");
        assert_eq!(set.snapshot(), vec!["b".to_string()]);
    }

    #[test]
    fn test_concurrent_inserts_stay_bounded() {
        let set = Arc::new(PendingSet::new(50));
        let workers: Vec<_> = (0..4)
            .map(|w| {
                let set = set.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        set.insert(&format!("w{}-{}", w, i));
                        set.insert(&format!("shared-{}", i));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(set.len(), 50);
        assert_eq!(set.snapshot().len(), 50);
    }

    #[tokio::test]
    async fn test_poll_once_counts() {
        let chain = Arc::new(ScriptedChain::new());
        let tracker = MempoolTracker::new(
            chain.clone(),
            MempoolConfig {
                capacity: 2,
                ..Default::default()
            },
        );

        chain.set_pending(hashes(1..=3));
        let summary = tracker.poll_once().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                fetched: 3,
                inserted: 3,
                evicted: 1
            }
        );
        assert!(!tracker.is_pending("h1"));
        assert!(tracker.is_pending("h3"));

        chain.set_pending(hashes(3..=4));
        let summary = tracker.poll_once().await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.evicted, 1);
        assert_eq!(tracker.snapshot(), hashes(3..=4));
    }

    #[tokio::test]
    async fn test_loop_survives_source_errors() {
        let chain = Arc::new(ScriptedChain::new());
        chain.fail_pending(vec![
            SourceError::Fatal("connection refused".into()),
            SourceError::Transient("warming up".into()),
        ]);
        chain.set_pending(hashes(1..=2));

        let tracker = MempoolTracker::new(
            chain.clone(),
            MempoolConfig {
                poll_interval_ms: 5,
                error_backoff_ms: 5,
                ..Default::default()
            },
        );
        tracker.start().await.unwrap();
        assert_eq!(tracker.start().await, Err(ScanError::AlreadyRunning));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !tracker.is_pending("h2") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tracker.stop().await.unwrap();
        assert!(!tracker.is_running().await);
        assert_eq!(tracker.stop().await, Err(ScanError::NotRunning));
    }

    #[tokio::test]
    async fn test_stop_is_prompt_with_long_interval() {
        let chain = Arc::new(ScriptedChain::new());
        let tracker = MempoolTracker::new(chain, MempoolConfig::default());
        tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(5), tracker.stop())
            .await
            .unwrap()
            .unwrap();
    }
}
