//! Reorganization detection and repair.

use super::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use chainscan_common::{BlockRecord, BlockSource, LedgerStore, ScanError, ScanResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of comparing a candidate block against the trusted tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkCheck {
    NoFork,
    Fork,
}

/// A located fork point and the repair applied for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkResolution {
    /// Most recent stored ancestor of the candidate
    pub fork_point: BlockRecord,
    /// Blocks re-flagged as forked
    pub flagged: usize,
    /// Parent lookups issued against the source
    pub lookups: usize,
}

pub struct ForkResolver {
    source: Arc<dyn BlockSource>,
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    max_depth: usize,
}

impl ForkResolver {
    pub fn new(
        source: Arc<dyn BlockSource>,
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
        max_depth: usize,
    ) -> Self {
        Self {
            source,
            store,
            retry,
            max_depth,
        }
    }

    /// Compares `candidate` against the trusted tip. When the candidate is the
    /// tip itself or extends it, the tip advances to the candidate.
    pub fn detect(tip: &mut BlockRecord, candidate: &BlockRecord) -> ForkCheck {
        if candidate.hash == tip.hash || candidate.parent_hash == tip.hash {
            *tip = candidate.clone();
            ForkCheck::NoFork
        } else {
            ForkCheck::Fork
        }
    }

    /// Walks back from the candidate's parent until a stored block is found.
    ///
    /// Stored hashes cost a ledger read; only unknown hashes go to the source,
    /// so the lookup count equals the distance to the nearest stored ancestor.
    pub async fn find_fork_point(
        &self,
        candidate: &BlockRecord,
        shutdown: &ShutdownSignal,
    ) -> ScanResult<(BlockRecord, usize)> {
        let mut hash = candidate.parent_hash.clone();
        let mut lookups = 0usize;

        loop {
            if hash.is_empty() {
                return Err(ScanError::ForkResolution(format!(
                    "reached the first block without a stored ancestor of {}",
                    candidate.hash
                )));
            }

            if let Some(ancestor) = self.store.block_by_hash(&hash).await? {
                debug!(
                    "Found fork point {} at height {} after {} lookups",
                    ancestor.hash, ancestor.height, lookups
                );
                return Ok((ancestor, lookups));
            }

            if lookups >= self.max_depth {
                return Err(ScanError::ForkTooDeep {
                    depth: lookups,
                    from: candidate.hash.clone(),
                });
            }

            let source = &self.source;
            let current = &hash;
            let parent = self
                .retry
                .run("parent lookup", shutdown, || source.parent_hash(current))
                .await
                .map_err(|e| match e {
                    ScanError::Source(e) => ScanError::ForkResolution(format!(
                        "parent lookup of {} failed: {}",
                        hash, e
                    )),
                    other => other,
                })?;
            lookups += 1;
            hash = parent;
        }
    }

    /// Locates the fork point, re-flags every stored block strictly between
    /// it and the candidate, then re-points the trusted tip at it.
    pub async fn resolve(
        &self,
        tip: &mut BlockRecord,
        candidate: &BlockRecord,
        shutdown: &ShutdownSignal,
    ) -> ScanResult<ForkResolution> {
        warn!(
            "Fork detected at height {}: {} does not extend {}",
            candidate.height, candidate.hash, tip.hash
        );

        let (fork_point, lookups) = self.find_fork_point(candidate, shutdown).await?;
        let flagged = self
            .store
            .mark_fork_range(&fork_point.height, &candidate.height)
            .await?;

        info!(
            "Fork resolved: fork point {} at height {}, {} blocks re-flagged",
            fork_point.hash, fork_point.height, flagged
        );

        *tip = fork_point.clone();
        Ok(ForkResolution {
            fork_point,
            flagged,
            lookups,
        })
    }
}
