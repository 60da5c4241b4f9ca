//! Header retrieval from the origin peer and header processing.

use super::{DownloaderInner, HeaderDeliveries, WakeSenders};
use crate::{
    fetch::HeaderFiller,
    peers::{ContentKind, PeerConnection},
};
use aqua_interfaces::{
    p2p::{SyncError, SyncResult},
    sync::SyncMode,
};
use aqua_primitives::{BlockNumber, SealedHeader, B256, U256};
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Pause of the header processor while the content fetchers catch up.
const PROCESSOR_BACKOFF: Duration = Duration::from_secs(1);

/// Waits for the answer of `peer` to an outstanding header request.
///
/// Deliveries of other peers are discarded, they cannot be matched to a request at this point.
pub(crate) async fn wait_for_headers(
    peer: &PeerConnection,
    deliveries: &mut HeaderDeliveries,
    cancel: &CancellationToken,
    ttl: Duration,
) -> SyncResult<Vec<SealedHeader>> {
    let timeout = tokio::time::sleep(ttl);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::CancelHeaderFetch),
            _ = &mut timeout => {
                debug!(target: "downloaders::sync", peer_id = %peer.id(), ?ttl, "Header request timed out");
                return Err(SyncError::Timeout)
            }
            packet = deliveries.recv() => {
                let Some(packet) = packet else { return Err(SyncError::CancelHeaderFetch) };
                if packet.peer_id() != peer.id() {
                    aqua_tracing::throttle!(Duration::from_secs(1), || {
                        trace!(target: "downloaders::sync", peer_id = %packet.peer_id(), "Headers from unexpected peer")
                    });
                    continue
                }
                return Ok(packet.into_data())
            }
        }
    }
}

/// Checks that a skeleton holds at most `max` headers, every `batch`-th one from `from` on.
fn check_skeleton(
    from: BlockNumber,
    batch: u64,
    max: u64,
    skeleton: &[SealedHeader],
) -> SyncResult<()> {
    if skeleton.len() as u64 > max {
        return Err(SyncError::BadPeer)
    }
    let numbered = skeleton
        .iter()
        .enumerate()
        .all(|(index, header)| header.number == from + (index as u64 + 1) * batch - 1);
    if !numbered {
        return Err(SyncError::BadPeer)
    }
    Ok(())
}

/// Hands a batch to the header processor.
async fn forward(
    processor: &mpsc::Sender<Vec<SealedHeader>>,
    headers: Vec<SealedHeader>,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::CancelHeaderFetch),
        sent = processor.send(headers) => sent.map_err(|_| SyncError::CancelHeaderFetch),
    }
}

// === impl DownloaderInner ===

impl DownloaderInner {
    /// Retrieves the header the peer advertised as its head.
    pub(super) async fn fetch_height(
        &self,
        peer: &PeerConnection,
        head: B256,
        deliveries: &mut HeaderDeliveries,
        cancel: &CancellationToken,
    ) -> SyncResult<SealedHeader> {
        trace!(target: "downloaders::sync", peer_id = %peer.id(), %head, "Retrieving remote chain height");
        peer.client().request_headers_by_hash(head, 1, 0, false)?;

        let headers = wait_for_headers(peer, deliveries, cancel, self.peers.request_ttl()).await?;
        let [header] = <[SealedHeader; 1]>::try_from(headers).map_err(|headers| {
            debug!(target: "downloaders::sync", peer_id = %peer.id(), count = headers.len(), "Multiple headers for single request");
            SyncError::BadPeer
        })?;
        if header.hash() != head {
            debug!(target: "downloaders::sync", peer_id = %peer.id(), hash = %header.hash(), %head, "Head header does not match the advertised head");
            return Err(SyncError::BadPeer)
        }
        debug!(target: "downloaders::sync", peer_id = %peer.id(), number = header.number, hash = %header.hash(), "Remote head header identified");
        Ok(header)
    }

    /// Retrieves headers from the origin peer starting at `from`.
    ///
    /// Headers are pulled as a skeleton of every `max_header_fetch`-th header whose gaps are
    /// filled by all idle peers. Once the peer runs out of skeleton headers the remaining tail
    /// is requested directly. An empty batch sent to the processor marks the end.
    pub(super) async fn fetch_headers(
        self: Arc<Self>,
        peer: Arc<PeerConnection>,
        mut from: BlockNumber,
        mut deliveries: HeaderDeliveries,
        processor: mpsc::Sender<Vec<SealedHeader>>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        debug!(target: "downloaders::sync", peer_id = %peer.id(), from, "Directing header downloads");
        let batch = self.config.max_header_fetch;
        let mut skeleton = true;

        loop {
            if skeleton {
                trace!(target: "downloaders::sync", peer_id = %peer.id(), from, count = self.config.max_skeleton_size, "Fetching skeleton headers");
                peer.client().request_headers_by_number(
                    from + batch - 1,
                    self.config.max_skeleton_size,
                    batch - 1,
                    false,
                )?;
            } else {
                trace!(target: "downloaders::sync", peer_id = %peer.id(), from, count = batch, "Fetching full headers");
                peer.client().request_headers_by_number(from, batch, 0, false)?;
            }
            let ttl = self.peers.request_ttl();
            let mut headers = wait_for_headers(&peer, &mut deliveries, &cancel, ttl).await?;

            if headers.is_empty() {
                if skeleton {
                    trace!(target: "downloaders::sync", peer_id = %peer.id(), from, "Skeleton exhausted, fetching the tail");
                    skeleton = false;
                    continue
                }
                // the pivot may still move past the remote head while its state is retrieved
                let pivot = self.pivot.load(Ordering::SeqCst);
                if !self.committed.load(Ordering::SeqCst) && pivot <= from {
                    trace!(target: "downloaders::sync", peer_id = %peer.id(), from, pivot, "No headers yet, waiting for pivot commit");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::CancelHeaderFetch),
                        _ = tokio::time::sleep(self.config.fs_header_cont_check) => {}
                    }
                    continue
                }
                debug!(target: "downloaders::sync", peer_id = %peer.id(), from, "No more headers available");
                forward(&processor, Vec::new(), &cancel).await?;
                return Ok(())
            }

            if skeleton {
                if let Err(err) = check_skeleton(from, batch, self.config.max_skeleton_size, &headers)
                {
                    debug!(target: "downloaders::sync", peer_id = %peer.id(), from, count = headers.len(), "Malformed skeleton");
                    return Err(err)
                }
                let fill = self
                    .fill_header_skeleton(from, headers, &processor, &mut deliveries, &cancel)
                    .await;
                let (filled, proced) = match fill {
                    Ok(fill) => fill,
                    Err(err) if err.is_cancellation() => return Err(err),
                    Err(err) => {
                        debug!(target: "downloaders::sync", peer_id = %peer.id(), from, %err, "Skeleton chain invalid");
                        return Err(SyncError::InvalidChain)
                    }
                };
                from += proced as u64;
                headers = filled;
            } else if headers.len() as u64 > batch {
                debug!(target: "downloaders::sync", peer_id = %peer.id(), from, count = headers.len(), "Oversized header batch");
                return Err(SyncError::BadPeer)
            }
            if !headers.is_empty() {
                trace!(target: "downloaders::sync", from, count = headers.len(), "Scheduling new headers");
                let count = headers.len() as u64;
                forward(&processor, headers, &cancel).await?;
                from += count;
            }
        }
    }

    /// Fills the gaps of a skeleton through all idle peers.
    ///
    /// Returns the filled headers not yet forwarded to the processor and the number of headers
    /// forwarded during the fill.
    async fn fill_header_skeleton(
        &self,
        from: BlockNumber,
        skeleton: Vec<SealedHeader>,
        processor: &mpsc::Sender<Vec<SealedHeader>>,
        deliveries: &mut HeaderDeliveries,
        cancel: &CancellationToken,
    ) -> SyncResult<(Vec<SealedHeader>, usize)> {
        debug!(target: "downloaders::sync", from, batches = skeleton.len(), "Filling up skeleton");
        self.queue.schedule_skeleton(from, skeleton);

        let filler = HeaderFiller { inner: self, processor };
        let result = self.fetch_parts(&filler, deliveries, None, cancel).await;
        let (filled, proced) = self.queue.retrieve_headers();
        result?;

        debug!(target: "downloaders::sync", from, proced, remaining = filled.len(), "Skeleton fill terminated");
        Ok((filled, proced))
    }

    /// Imports the headers coming from [`Self::fetch_headers`] and schedules their content.
    ///
    /// In fast sync headers are inserted into the local header chain right away. If the cycle
    /// fails, the most recent of those headers are rolled back, since most of them were
    /// inserted without verifying their seal. The cycle is flagged as rolled back then, whichever
    /// task caused the failure.
    pub(super) async fn process_headers(
        self: Arc<Self>,
        mut origin: BlockNumber,
        td: U256,
        mode: SyncMode,
        mut headers: mpsc::Receiver<Vec<SealedHeader>>,
        wake: WakeSenders,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        let mut rollback = Vec::new();
        let result = self
            .import_headers(&mut origin, td, mode, &mut headers, &wake, &cancel, &mut rollback)
            .await;

        if let Err(err) = &result {
            if !rollback.is_empty() {
                self.chain.rollback(&rollback);
                self.metrics.rollbacks.increment(1);
                let head = self.chain.current_header();
                warn!(
                    target: "downloaders::sync",
                    count = rollback.len(),
                    header = head.number,
                    fast = self.chain.current_fast_block().number,
                    block = self.chain.current_block().number,
                    %err,
                    "Rolled back headers"
                );
                self.rolled_back.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn import_headers(
        &self,
        origin: &mut BlockNumber,
        td: U256,
        mode: SyncMode,
        headers: &mut mpsc::Receiver<Vec<SealedHeader>>,
        wake: &WakeSenders,
        cancel: &CancellationToken,
        rollback: &mut Vec<B256>,
    ) -> SyncResult<()> {
        let mut got_headers = false;
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::CancelHeaderProcessing),
                batch = headers.recv() => batch,
            };
            let Some(batch) = batch else { return Err(SyncError::CancelHeaderProcessing) };

            if batch.is_empty() {
                wake.finish(cancel).await;
                // a peer advertising more difficulty than it delivered is lying
                if !got_headers {
                    let head = self.chain.current_block();
                    if self.chain.total_difficulty(head.hash(), head.number).is_some_and(|local| td > local) {
                        debug!(target: "downloaders::sync", %td, "Peer delivered no headers despite higher difficulty");
                        return Err(SyncError::StallingPeer)
                    }
                }
                if mode.is_fast() {
                    let head = self.chain.current_header();
                    if self.chain.total_difficulty(head.hash(), head.number).is_some_and(|local| td > local) {
                        debug!(target: "downloaders::sync", %td, number = head.number, "Header chain falls short of the advertised difficulty");
                        return Err(SyncError::StallingPeer)
                    }
                }
                rollback.clear();
                return Ok(())
            }
            got_headers = true;

            for chunk in batch.chunks(self.config.max_headers_process.max(1)) {
                if cancel.is_cancelled() {
                    return Err(SyncError::CancelHeaderProcessing)
                }
                if mode.is_fast() {
                    self.insert_headers(chunk, rollback)?;
                }

                while self.queue.pending(ContentKind::Bodies) >= self.config.max_queued_headers ||
                    self.queue.pending(ContentKind::Receipts) >= self.config.max_queued_headers
                {
                    trace!(target: "downloaders::sync", "Content queue full, pausing header processing");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::CancelHeaderProcessing),
                        _ = tokio::time::sleep(PROCESSOR_BACKOFF) => {}
                    }
                }

                let inserted = self.queue.schedule(chunk, *origin);
                if inserted != chunk.len() {
                    debug!(target: "downloaders::sync", from = *origin, inserted, count = chunk.len(), "Headers do not continue the scheduled chain");
                    return Err(SyncError::InvalidChain)
                }
                *origin += chunk.len() as u64;
            }

            self.raise_chain_height(*origin - 1);
            wake.notify();
        }
    }

    /// Inserts a chunk into the header chain, remembering the new headers for rollback.
    fn insert_headers(&self, chunk: &[SealedHeader], rollback: &mut Vec<B256>) -> SyncResult<()> {
        let Some(last) = chunk.last() else { return Ok(()) };
        let unknown = chunk
            .iter()
            .filter(|header| !self.chain.has_header(header.hash(), header.number))
            .collect::<Vec<_>>();

        let pivot = self.pivot.load(Ordering::SeqCst);
        let frequency = if last.number + self.config.fs_header_force_verify > pivot {
            1
        } else {
            self.config.fs_header_check_frequency
        };

        if let Err(err) = self.chain.insert_header_chain(chunk, frequency) {
            let failed = chunk.get(err.index).map_or(last.number + 1, |header| header.number);
            rollback.extend(
                unknown.iter().take_while(|header| header.number < failed).map(|header| header.hash()),
            );
            debug!(target: "downloaders::sync", number = failed, err = %err.error, "Invalid header encountered");
            return Err(SyncError::InvalidChain)
        }

        rollback.extend(unknown.iter().map(|header| header.hash()));
        let limit = self.config.fs_header_safety_net;
        if rollback.len() > limit {
            rollback.drain(..rollback.len() - limit);
        }
        Ok(())
    }
}
