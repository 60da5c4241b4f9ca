//! Block content retrieval and hand off to the chain.

use super::{DownloaderInner, NodeDataDeliveries};
use crate::{
    fetch::{BodyFetcher, ReceiptFetcher},
    queue::FetchResult,
    state::StateSync,
};
use aqua_interfaces::p2p::{SyncError, SyncResult};
use aqua_primitives::{BlockBody, BlockNumber, Receipt, SealedHeader, WithPeerId};
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How long the content processor waits for the pivot state before checking for new results.
const PIVOT_STATE_POLL: Duration = Duration::from_secs(1);

/// Splits results into the pivot block, the blocks before and the blocks after it.
fn split_around_pivot(
    pivot: BlockNumber,
    results: Vec<FetchResult>,
) -> (Option<FetchResult>, Vec<FetchResult>, Vec<FetchResult>) {
    let mut at = None;
    let mut before = Vec::new();
    let mut after = Vec::new();
    for result in results {
        match result.number().cmp(&pivot) {
            std::cmp::Ordering::Less => before.push(result),
            std::cmp::Ordering::Equal => at = Some(result),
            std::cmp::Ordering::Greater => after.push(result),
        }
    }
    (at, before, after)
}

// === impl DownloaderInner ===

impl DownloaderInner {
    pub(super) async fn fetch_bodies(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<WithPeerId<Vec<BlockBody>>>,
        wake: mpsc::Receiver<bool>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        debug!(target: "downloaders::fetch", "Downloading block bodies");
        let fetcher = BodyFetcher { inner: &self };
        self.fetch_parts(&fetcher, &mut deliveries, Some(wake), &cancel).await
    }

    pub(super) async fn fetch_receipts(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<WithPeerId<Vec<Vec<Receipt>>>>,
        wake: mpsc::Receiver<bool>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        debug!(target: "downloaders::fetch", "Downloading transaction receipts");
        let fetcher = ReceiptFetcher { inner: &self };
        self.fetch_parts(&fetcher, &mut deliveries, Some(wake), &cancel).await
    }

    /// Executes completed blocks in order until the queue is closed and drained.
    pub(super) async fn process_full_sync_content(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        loop {
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::CancelContentProcessing),
                results = self.queue.results() => results,
            };
            if results.is_empty() {
                return Ok(())
            }
            self.import_block_results(results, &cancel)?;
        }
    }

    fn import_block_results(
        &self,
        results: Vec<FetchResult>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let (Some(first), Some(last)) = (results.first(), results.last()) else { return Ok(()) };
        if cancel.is_cancelled() {
            return Err(SyncError::CancelContentProcessing)
        }
        self.observer.on_chain_insert(&results);
        debug!(
            target: "downloaders::sync",
            items = results.len(),
            first = first.number(),
            first_hash = %first.hash(),
            last = last.number(),
            last_hash = %last.hash(),
            "Inserting downloaded chain"
        );

        let count = results.len();
        let blocks = results.into_iter().map(FetchResult::into_block).collect();
        if let Err(err) = self.chain.insert_chain(blocks) {
            debug!(target: "downloaders::sync", index = err.index, err = %err.error, "Downloaded item processing failed");
            return Err(SyncError::InvalidChain)
        }
        self.queue.commit(count);
        self.metrics.blocks_inserted.increment(count as u64);
        self.metrics.cached_results.set(self.queue.cached_results() as f64);
        Ok(())
    }

    /// Stores blocks below the pivot with their receipts, waits for the pivot state and executes
    /// the blocks after it.
    pub(super) async fn process_fast_sync_content(
        self: Arc<Self>,
        latest: SealedHeader,
        node_data: NodeDataDeliveries,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        let mut state_sync = None;
        let result = self.drive_fast_sync_content(latest, &node_data, &mut state_sync, &cancel).await;
        if let Some(sync) = state_sync {
            // the outcome is irrelevant once the content processor is done
            let _ = sync.cancel().await;
        }
        result
    }

    async fn drive_fast_sync_content(
        self: &Arc<Self>,
        latest: SealedHeader,
        node_data: &NodeDataDeliveries,
        state_sync: &mut Option<StateSync>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mut pivot = latest.number.saturating_sub(self.config.fs_min_full_blocks);
        // the pivot and the blocks after it, held back until the pivot state is retrieved
        let mut held: Vec<FetchResult> = Vec::new();

        loop {
            let fresh = if held.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::CancelContentProcessing),
                    results = self.queue.results() => results,
                }
            } else {
                self.queue.take_ready()
            };
            if fresh.is_empty() && held.is_empty() {
                return Ok(())
            }
            if cancel.is_cancelled() {
                return Err(SyncError::CancelContentProcessing)
            }
            if !fresh.is_empty() {
                self.observer.on_chain_insert(&fresh);
            }
            let mut results = std::mem::take(&mut held);
            results.extend(fresh);

            if !self.committed.load(Ordering::SeqCst) {
                if let Some(last) = results.last() {
                    let height = last.number();
                    if height > pivot + 2 * self.config.fs_min_full_blocks {
                        let moved = height - self.config.fs_min_full_blocks;
                        warn!(target: "downloaders::sync", old = pivot, new = moved, "Pivot became stale, moving");
                        pivot = moved;
                        self.pivot.store(pivot, Ordering::SeqCst);
                    }
                }
            }

            let (at, before, after) = split_around_pivot(pivot, results);
            self.commit_fast_sync_data(before, state_sync, cancel).await?;

            if let Some(at) = at {
                if state_sync.as_ref().is_some_and(|sync| sync.pivot().hash() != at.hash()) {
                    if let Some(stale) = state_sync.take() {
                        let _ = stale.cancel().await;
                    }
                }
                let sync = state_sync.get_or_insert_with(|| {
                    debug!(target: "downloaders::state", number = at.number(), hash = %at.hash(), "Retrieving pivot state");
                    self.spawn_state_sync(at.header.clone(), Arc::clone(node_data), cancel)
                });

                let state = tokio::time::timeout(PIVOT_STATE_POLL, sync.wait()).await;
                match state {
                    Ok(Ok(())) => {
                        self.commit_pivot_block(at)?;
                        state_sync.take();
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        trace!(target: "downloaders::state", number = at.number(), "Pivot state pending");
                        held.push(at);
                        held.extend(after);
                        continue
                    }
                }
            }

            if !after.is_empty() {
                self.import_block_results(after, cancel)?;
            }
        }
    }

    /// Stores blocks with their receipts, without executing them.
    async fn commit_fast_sync_data(
        &self,
        results: Vec<FetchResult>,
        state_sync: &mut Option<StateSync>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let (Some(first), Some(last)) = (results.first(), results.last()) else { return Ok(()) };
        // a failed state retrieval makes the whole fast sync pointless
        if let Some(sync) = state_sync.as_mut().filter(|sync| sync.is_finished()) {
            sync.wait().await?;
        }
        if cancel.is_cancelled() {
            return Err(SyncError::CancelContentProcessing)
        }
        debug!(
            target: "downloaders::sync",
            items = results.len(),
            first = first.number(),
            first_hash = %first.hash(),
            last = last.number(),
            last_hash = %last.hash(),
            "Inserting fast-sync blocks"
        );

        let count = results.len();
        let (blocks, receipts): (Vec<_>, Vec<_>) =
            results.into_iter().map(FetchResult::into_parts).unzip();
        if let Err(err) = self.chain.insert_receipt_chain(blocks, receipts) {
            debug!(target: "downloaders::sync", index = err.index, err = %err.error, "Downloaded item processing failed");
            return Err(SyncError::InvalidChain)
        }
        self.queue.commit(count);
        self.metrics.blocks_inserted.increment(count as u64);
        self.metrics.cached_results.set(self.queue.cached_results() as f64);
        Ok(())
    }

    /// Stores the pivot block and makes it the head of the full chain.
    fn commit_pivot_block(&self, result: FetchResult) -> SyncResult<()> {
        let hash = result.hash();
        let number = result.number();
        debug!(target: "downloaders::sync", number, %hash, "Committing fast sync pivot as new head");

        let (block, receipts) = result.into_parts();
        self.chain
            .insert_receipt_chain(vec![block], vec![receipts])
            .map_err(|err| SyncError::Provider(err.error))?;
        self.chain.fast_sync_commit_head(hash)?;
        self.committed.store(true, Ordering::SeqCst);
        self.queue.commit(1);
        self.metrics.blocks_inserted.increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peers::ContentKind, queue::ResultQueue, test_utils::TestBlocks};
    use aqua_config::DownloaderConfig;
    use aqua_interfaces::sync::SyncMode;

    #[test]
    fn split_results_around_pivot() {
        let blocks = TestBlocks::genesis().extend_empty(6, 0);
        let queue = ResultQueue::new(&DownloaderConfig::default());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&blocks.headers()[1..], 1);
        let peer = crate::peers::PeerConnection::new(
            "a".into(),
            63,
            Arc::new(crate::test_utils::NoopSyncPeer::default()),
            &DownloaderConfig::default(),
        );
        queue.reserve(ContentKind::Bodies, &peer, 10).unwrap();
        let results = queue.take_ready();
        assert_eq!(results.len(), 6);

        let (at, before, after) = split_around_pivot(4, results.clone());
        assert_eq!(at.map(|result| result.number()), Some(4));
        assert_eq!(before.iter().map(FetchResult::number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(after.iter().map(FetchResult::number).collect::<Vec<_>>(), vec![5, 6]);

        let (at, before, after) = split_around_pivot(0, results);
        assert!(at.is_none());
        assert!(before.is_empty());
        assert_eq!(after.len(), 6);
    }
}
