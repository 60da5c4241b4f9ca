//! The shared retrieval loop driving skeleton fills, bodies and receipts.
//!
//! Each kind of content plugs into [`DownloaderInner::fetch_parts`] through [`FetchParts`]: the
//! loop hands tasks to idle peers, routes deliveries back into the [`ResultQueue`], expires
//! requests that took too long and detects when no peer is able to make progress anymore.
//!
//! [`ResultQueue`]: crate::queue::ResultQueue

use crate::{
    downloader::DownloaderInner,
    peers::{ContentKind, PeerConnection},
    queue::{DeliveryError, FetchRequest, Reservation},
    reputation::ReputationChangeKind,
};
use aqua_interfaces::p2p::{RequestResult, SyncError, SyncResult};
use aqua_primitives::{BlockBody, PeerId, Receipt, SealedHeader, WithPeerId};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How often outstanding requests are checked for expiry and idle peers for new work.
pub(crate) const FETCH_TICK: Duration = Duration::from_millis(100);

/// One kind of content retrieved by [`DownloaderInner::fetch_parts`].
pub(crate) trait FetchParts {
    /// The payload of a single delivery.
    type Item: Send;

    /// The content retrieved.
    const KIND: ContentKind;

    /// Number of tasks waiting for a peer.
    fn pending(&self) -> usize;

    /// Whether any request is outstanding.
    fn in_flight(&self) -> bool;

    /// Whether assigning more work would overflow the result window.
    fn throttle(&self) -> bool {
        false
    }

    /// Whether no more tasks will ever be scheduled, independent of the wake channel.
    fn finished(&self) -> bool {
        false
    }

    /// Picks the next batch of work for the peer.
    fn reserve(&self, peer: &PeerConnection) -> Result<Reservation, SyncError>;

    /// Sends the request to the peer.
    fn fetch(&self, peer: &PeerConnection, request: &FetchRequest) -> RequestResult<()>;

    /// Matches a delivery against the peer's outstanding request.
    fn deliver(&self, peer: &PeerConnection, item: Self::Item) -> Result<usize, DeliveryError>;

    /// The error reported when the cycle is cancelled.
    fn cancel_error(&self) -> SyncError;
}

/// Waits for the next signal of the header processor.
///
/// `true` means new tasks were scheduled, `false` that no more will be. A closed channel counts
/// as the latter and is not polled again.
async fn next_wake(wake: &mut Option<mpsc::Receiver<bool>>) -> bool {
    let Some(receiver) = wake.as_mut() else { return std::future::pending().await };
    match receiver.recv().await {
        Some(cont) => cont,
        None => {
            *wake = None;
            false
        }
    }
}

// === impl DownloaderInner ===

impl DownloaderInner {
    /// Retrieves content of one kind until every scheduled task is done.
    ///
    /// The loop ends successfully once the header processor signalled that no more tasks will be
    /// scheduled, no task is pending and no request is outstanding.
    pub(crate) async fn fetch_parts<F: FetchParts>(
        &self,
        fetcher: &F,
        deliveries: &mut mpsc::UnboundedReceiver<WithPeerId<F::Item>>,
        mut wake: Option<mpsc::Receiver<bool>>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let kind = F::KIND;
        let metrics = self.fetch_metrics.get(kind);
        let mut ticker = interval(FETCH_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut finished = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(fetcher.cancel_error()),
                packet = deliveries.recv() => {
                    let Some(packet) = packet else { return Err(fetcher.cancel_error()) };
                    self.handle_delivery(fetcher, packet)?;
                }
                cont = next_wake(&mut wake) => {
                    if !cont {
                        finished = true;
                    }
                }
                _ = ticker.tick() => {}
            }

            if self.peers.is_empty() {
                return Err(SyncError::NoPeers)
            }
            self.expire_requests(kind);

            let pending = fetcher.pending();
            metrics.pending_tasks.set(pending as f64);
            if pending == 0 {
                if !fetcher.in_flight() && (finished || fetcher.finished()) {
                    debug!(target: "downloaders::fetch", %kind, "Data fetching completed");
                    return Ok(())
                }
                continue
            }
            self.assign_tasks(fetcher)?;
        }
    }

    fn handle_delivery<F: FetchParts>(
        &self,
        fetcher: &F,
        packet: WithPeerId<F::Item>,
    ) -> SyncResult<()> {
        let kind = F::KIND;
        let metrics = self.fetch_metrics.get(kind);
        let (peer_id, item) = packet.split();
        let Some(peer) = self.peers.peer(&peer_id) else {
            trace!(target: "downloaders::fetch", %peer_id, %kind, "Delivery from dropped peer");
            return Ok(())
        };

        match fetcher.deliver(&peer, item) {
            Ok(accepted) => {
                trace!(target: "downloaders::fetch", %peer_id, %kind, accepted, "Delivered data");
                metrics.delivered.increment(accepted as u64);
                peer.set_idle(kind, accepted);
            }
            Err(DeliveryError::InvalidChain(err)) => {
                debug!(target: "downloaders::fetch", %peer_id, %kind, %err, "Delivery broke the result window");
                return Err(err)
            }
            Err(DeliveryError::Stale(err)) => {
                debug!(target: "downloaders::fetch", %peer_id, %kind, %err, "Stale delivery");
                metrics.invalid_deliveries.increment(1);
                peer.set_idle(kind, 0);
                self.penalize(&peer_id, ReputationChangeKind::BadBlock);
            }
            Err(DeliveryError::Partial(accepted, err)) => {
                debug!(target: "downloaders::fetch", %peer_id, %kind, accepted, %err, "Partially invalid delivery");
                metrics.delivered.increment(accepted as u64);
                metrics.invalid_deliveries.increment(1);
                peer.set_idle(kind, accepted);
                self.penalize(&peer_id, ReputationChangeKind::BadBlock);
            }
            Err(DeliveryError::NotAccepted) => {
                metrics.invalid_deliveries.increment(1);
                peer.set_idle(kind, 0);
                self.penalize(&peer_id, ReputationChangeKind::BadMessage);
            }
            Err(DeliveryError::NoFetchesPending) => {
                trace!(target: "downloaders::fetch", %peer_id, %kind, "Unrequested delivery");
                peer.set_idle(kind, 0);
            }
        }
        Ok(())
    }

    /// Returns the work of timed out requests to the queue.
    ///
    /// A peer that failed a large request is throttled down, one that failed a small request is
    /// unlikely to be useful at all and is dropped.
    fn expire_requests(&self, kind: ContentKind) {
        let ttl = self.peers.request_ttl();
        for (peer_id, fails) in self.queue.expire(kind, ttl) {
            self.fetch_metrics.get(kind).timeouts.increment(1);
            let Some(peer) = self.peers.peer(&peer_id) else { continue };
            if fails > 2 {
                trace!(target: "downloaders::fetch", %peer_id, %kind, fails, "Data delivery timed out");
                peer.set_idle(kind, 0);
            } else {
                debug!(target: "downloaders::fetch", %peer_id, %kind, fails, "Stalling delivery, dropping");
                self.drop_peer(&peer_id, ReputationChangeKind::Timeout);
            }
        }
    }

    /// Hands pending tasks to every idle peer, fastest first.
    fn assign_tasks<F: FetchParts>(&self, fetcher: &F) -> SyncResult<()> {
        let kind = F::KIND;
        let metrics = self.fetch_metrics.get(kind);
        let (idle, total) = self.peers.idle_peers(kind);

        let mut progressed = false;
        let mut throttled = false;
        let mut running = fetcher.in_flight();
        for peer in &idle {
            if fetcher.pending() == 0 {
                break
            }
            if fetcher.throttle() {
                throttled = true;
                metrics.throttled.increment(1);
                break
            }
            let reservation = fetcher.reserve(peer)?;
            progressed |= reservation.progress;
            let Some(request) = reservation.request else { continue };

            trace!(
                target: "downloaders::fetch",
                peer_id = %peer.id(),
                %kind,
                from = request.from,
                count = request.headers.len(),
                "Requesting data"
            );
            metrics.requests.increment(1);
            if let Err(err) = fetcher.fetch(peer, &request) {
                debug!(target: "downloaders::fetch", peer_id = %peer.id(), %kind, %err, "Failed to send request");
                self.queue.cancel(request);
                continue
            }
            running = true;
        }

        if !progressed && !throttled && !running && idle.len() == total && fetcher.pending() > 0 {
            debug!(target: "downloaders::fetch", %kind, peers = total, "No peer can serve the pending tasks");
            return Err(SyncError::PeersUnavailable)
        }
        Ok(())
    }

    /// Applies a penalty, dropping the peer if it crossed the ban threshold.
    pub(crate) fn penalize(&self, peer_id: &PeerId, kind: ReputationChangeKind) {
        if self.peers.report(peer_id, kind) {
            debug!(target: "downloaders::peers", %peer_id, ?kind, "Peer banned");
            self.unregister(peer_id);
        }
    }

    /// Penalizes and removes the peer.
    pub(crate) fn drop_peer(&self, peer_id: &PeerId, kind: ReputationChangeKind) {
        self.metrics.dropped_peers.increment(1);
        self.peers.report(peer_id, kind);
        self.unregister(peer_id);
    }
}

/// Fills the gaps between skeleton headers.
pub(crate) struct HeaderFiller<'a> {
    pub(crate) inner: &'a DownloaderInner,
    /// Filled headers are forwarded to the header processor whenever it is ready for more.
    pub(crate) processor: &'a mpsc::Sender<Vec<SealedHeader>>,
}

impl FetchParts for HeaderFiller<'_> {
    type Item = Vec<SealedHeader>;
    const KIND: ContentKind = ContentKind::Headers;

    fn pending(&self) -> usize {
        self.inner.queue.pending(Self::KIND)
    }

    fn in_flight(&self) -> bool {
        self.inner.queue.in_flight(Self::KIND)
    }

    fn finished(&self) -> bool {
        self.inner.queue.header_fill_done()
    }

    fn reserve(&self, peer: &PeerConnection) -> Result<Reservation, SyncError> {
        Ok(Reservation { request: self.inner.queue.reserve_headers(peer), progress: false })
    }

    fn fetch(&self, peer: &PeerConnection, request: &FetchRequest) -> RequestResult<()> {
        peer.fetch_headers(request.from, self.inner.config.max_header_fetch)
    }

    fn deliver(
        &self,
        peer: &PeerConnection,
        headers: Vec<SealedHeader>,
    ) -> Result<usize, DeliveryError> {
        let accepted = self.inner.queue.deliver_headers(peer, headers)?;
        if let Ok(permit) = self.processor.try_reserve() {
            let ready = self.inner.queue.take_ready_headers();
            if !ready.is_empty() {
                permit.send(ready);
            }
        }
        Ok(accepted)
    }

    fn cancel_error(&self) -> SyncError {
        SyncError::CancelHeaderFetch
    }
}

/// Retrieves block bodies.
pub(crate) struct BodyFetcher<'a> {
    pub(crate) inner: &'a DownloaderInner,
}

impl FetchParts for BodyFetcher<'_> {
    type Item = Vec<BlockBody>;
    const KIND: ContentKind = ContentKind::Bodies;

    fn pending(&self) -> usize {
        self.inner.queue.pending(Self::KIND)
    }

    fn in_flight(&self) -> bool {
        self.inner.queue.in_flight(Self::KIND)
    }

    fn throttle(&self) -> bool {
        self.inner.queue.throttle(Self::KIND)
    }

    fn reserve(&self, peer: &PeerConnection) -> Result<Reservation, SyncError> {
        let capacity = peer.capacity(Self::KIND, self.inner.peers.request_rtt());
        self.inner.queue.reserve(Self::KIND, peer, capacity)
    }

    fn fetch(&self, peer: &PeerConnection, request: &FetchRequest) -> RequestResult<()> {
        self.inner.observer.on_body_fetch(&request.headers);
        peer.fetch_bodies(&request.headers)
    }

    fn deliver(&self, peer: &PeerConnection, bodies: Vec<BlockBody>) -> Result<usize, DeliveryError> {
        self.inner.queue.deliver_bodies(peer, bodies)
    }

    fn cancel_error(&self) -> SyncError {
        SyncError::CancelBodyFetch
    }
}

/// Retrieves block receipts, fast sync only.
pub(crate) struct ReceiptFetcher<'a> {
    pub(crate) inner: &'a DownloaderInner,
}

impl FetchParts for ReceiptFetcher<'_> {
    type Item = Vec<Vec<Receipt>>;
    const KIND: ContentKind = ContentKind::Receipts;

    fn pending(&self) -> usize {
        self.inner.queue.pending(Self::KIND)
    }

    fn in_flight(&self) -> bool {
        self.inner.queue.in_flight(Self::KIND)
    }

    fn throttle(&self) -> bool {
        self.inner.queue.throttle(Self::KIND)
    }

    fn reserve(&self, peer: &PeerConnection) -> Result<Reservation, SyncError> {
        let capacity = peer.capacity(Self::KIND, self.inner.peers.request_rtt());
        self.inner.queue.reserve(Self::KIND, peer, capacity)
    }

    fn fetch(&self, peer: &PeerConnection, request: &FetchRequest) -> RequestResult<()> {
        self.inner.observer.on_receipt_fetch(&request.headers);
        peer.fetch_receipts(&request.headers)
    }

    fn deliver(
        &self,
        peer: &PeerConnection,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, DeliveryError> {
        self.inner.queue.deliver_receipts(peer, receipts)
    }

    fn cancel_error(&self) -> SyncError {
        SyncError::CancelReceiptFetch
    }
}
