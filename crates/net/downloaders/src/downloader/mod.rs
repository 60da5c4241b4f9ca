//! The [`Downloader`] ties peers, the result queue and the fetchers together into sync cycles.
//!
//! A cycle runs against a single origin peer: its head is looked up, the common ancestor with the
//! local chain is located and five tasks are started. The header fetcher pulls a skeleton from the
//! origin and lets every idle peer fill it, the header processor validates and schedules the
//! headers, body and receipt fetchers retrieve the block content and the content processor hands
//! completed blocks to the chain in order.

use crate::{
    ancestor::AncestorLocator,
    metrics::{ContentMetrics, SyncMetrics},
    observer::{NoopObserver, SyncObserver},
    peers::{PeerConnection, PeerSet, PeerSetError},
    queue::ResultQueue,
    reputation::{ReputationChangeKind, ReputationChangeWeights},
};
use aqua_config::DownloaderConfig;
use aqua_interfaces::{
    p2p::{SyncError, SyncPeer, SyncResult},
    provider::{BlockChain, StateProvider},
    sync::{SyncMode, SyncProgress, SyncStateProvider},
};
use aqua_primitives::{
    BlockBody, BlockNumber, Bytes, Header, PeerId, Receipt, SealedHeader, WithPeerId, B256, U256,
};
use parking_lot::Mutex;
use std::{
    fmt, panic,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

mod content;
pub(crate) mod headers;

#[cfg(test)]
mod tests;

/// Header deliveries of the running cycle.
pub(crate) type HeaderDeliveries = mpsc::UnboundedReceiver<WithPeerId<Vec<SealedHeader>>>;

/// State node deliveries of the running cycle.
///
/// Shared because the pivot, and with it the state retrieval, may change during a cycle.
pub(crate) type NodeDataDeliveries =
    Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WithPeerId<Vec<Bytes>>>>>;

/// Errors returned when registering a peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// A peer with the same id is already registered.
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
    /// The peer was banned for misbehaving.
    #[error("peer {0} is banned")]
    BannedPeer(PeerId),
    /// Any other refusal of the peer set.
    #[error(transparent)]
    PeerSet(PeerSetError),
}

impl From<PeerSetError> for RegisterError {
    fn from(err: PeerSetError) -> Self {
        match err {
            PeerSetError::Banned(id) => Self::BannedPeer(id),
            PeerSetError::AlreadyRegistered(id) => Self::DuplicatePeer(id),
            err @ PeerSetError::NotRegistered(_) => Self::PeerSet(err),
        }
    }
}

#[derive(Debug)]
struct DeliverySenders {
    headers: mpsc::UnboundedSender<WithPeerId<Vec<SealedHeader>>>,
    bodies: mpsc::UnboundedSender<WithPeerId<Vec<BlockBody>>>,
    receipts: mpsc::UnboundedSender<WithPeerId<Vec<Vec<Receipt>>>>,
    node_data: mpsc::UnboundedSender<WithPeerId<Vec<Bytes>>>,
}

struct DeliveryReceivers {
    headers: HeaderDeliveries,
    bodies: mpsc::UnboundedReceiver<WithPeerId<Vec<BlockBody>>>,
    receipts: mpsc::UnboundedReceiver<WithPeerId<Vec<Vec<Receipt>>>>,
    node_data: NodeDataDeliveries,
}

fn delivery_channels() -> (DeliverySenders, DeliveryReceivers) {
    let (headers_tx, headers_rx) = mpsc::unbounded_channel();
    let (bodies_tx, bodies_rx) = mpsc::unbounded_channel();
    let (receipts_tx, receipts_rx) = mpsc::unbounded_channel();
    let (node_data_tx, node_data_rx) = mpsc::unbounded_channel();
    (
        DeliverySenders {
            headers: headers_tx,
            bodies: bodies_tx,
            receipts: receipts_tx,
            node_data: node_data_tx,
        },
        DeliveryReceivers {
            headers: headers_rx,
            bodies: bodies_rx,
            receipts: receipts_rx,
            node_data: Arc::new(tokio::sync::Mutex::new(node_data_rx)),
        },
    )
}

/// The cycle currently running.
#[derive(Debug)]
struct ActiveCycle {
    /// The origin peer, unregistering it aborts the cycle.
    peer_id: PeerId,
    cancel: CancellationToken,
    senders: DeliverySenders,
}

/// Block range of the running or last cycle.
#[derive(Debug, Default, Clone, Copy)]
struct ChainProgress {
    origin: BlockNumber,
    height: BlockNumber,
}

/// Signals from the header processor to the content fetchers.
///
/// `true` announces new tasks, `false` that no more will be scheduled.
pub(crate) struct WakeSenders {
    bodies: mpsc::Sender<bool>,
    receipts: mpsc::Sender<bool>,
}

impl WakeSenders {
    /// Announces new tasks. Pending announcements are not repeated.
    fn notify(&self) {
        let _ = self.bodies.try_send(true);
        let _ = self.receipts.try_send(true);
    }

    /// Announces that header processing is done.
    async fn finish(&self, cancel: &CancellationToken) {
        for wake in [&self.bodies, &self.receipts] {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = wake.send(false) => {}
            }
        }
    }
}

/// Marks the downloader as busy for as long as it is alive.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).ok().map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tears the cycle down once dropped, including when the cycle future itself is dropped.
struct CycleGuard<'a> {
    inner: &'a DownloaderInner,
    cancel: CancellationToken,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        *self.inner.cycle.lock() = None;
        self.inner.queue.close();
        self.inner.queue.reset();
    }
}

/// State shared between the [`Downloader`] handle and the tasks of a cycle.
pub(crate) struct DownloaderInner {
    pub(crate) config: DownloaderConfig,
    pub(crate) chain: Arc<dyn BlockChain>,
    pub(crate) state: Arc<dyn StateProvider>,
    pub(crate) observer: Arc<dyn SyncObserver>,
    pub(crate) peers: PeerSet,
    pub(crate) queue: ResultQueue,
    cycle: Mutex<Option<ActiveCycle>>,
    synchronising: AtomicBool,
    /// Set once a fast cycle rolled back headers, later cycles fall back to full sync.
    fast_sync_disabled: AtomicBool,
    /// Whether the header processor rolled back headers during the running or last cycle.
    rolled_back: AtomicBool,
    /// Mode of the running or last cycle.
    mode: Mutex<SyncMode>,
    /// Current fast sync pivot, zero outside of fast sync.
    pub(crate) pivot: AtomicU64,
    /// Whether the pivot block (and with it the state) was committed.
    pub(crate) committed: AtomicBool,
    chain_progress: Mutex<ChainProgress>,
    pub(crate) pulled_states: AtomicU64,
    pub(crate) known_states: AtomicU64,
    quit: CancellationToken,
    pub(crate) metrics: SyncMetrics,
    pub(crate) fetch_metrics: ContentMetrics,
}

// === impl DownloaderInner ===

impl DownloaderInner {
    /// Removes the peer and returns its outstanding work, cancelling the cycle if it is the origin.
    pub(crate) fn unregister(&self, peer_id: &PeerId) {
        if let Err(err) = self.peers.unregister(peer_id) {
            trace!(target: "downloaders::peers", %err, "Unregistering unknown peer");
        }
        self.queue.revoke(peer_id);

        let cycle = self.cycle.lock();
        if let Some(cycle) = cycle.as_ref().filter(|cycle| &cycle.peer_id == peer_id) {
            debug!(target: "downloaders::sync", %peer_id, "Origin peer left, cancelling sync");
            cycle.cancel.cancel();
        }
    }

    fn deliver<T>(
        &self,
        peer_id: &PeerId,
        data: T,
        channel: impl FnOnce(&DeliverySenders) -> &mpsc::UnboundedSender<WithPeerId<T>>,
    ) -> SyncResult<()> {
        let cycle = self.cycle.lock();
        let Some(cycle) = cycle.as_ref() else { return Err(SyncError::NoSyncActive) };
        if !self.peers.contains(peer_id) {
            return Err(SyncError::UnknownPeer)
        }
        // closed once the cycle winds down, the delivery is moot then
        let _ = channel(&cycle.senders).send(WithPeerId::new(peer_id.clone(), data));
        Ok(())
    }

    fn update_chain_progress(&self, origin: BlockNumber, height: BlockNumber) {
        let mut progress = self.chain_progress.lock();
        if progress.height <= origin || progress.origin > origin {
            progress.origin = origin;
        }
        progress.height = height;
    }

    /// Raises the highest known block once headers beyond it were scheduled.
    pub(crate) fn raise_chain_height(&self, height: BlockNumber) {
        let mut progress = self.chain_progress.lock();
        if progress.height < height {
            progress.height = height;
            self.metrics.highest_block.set(height as f64);
        }
    }

    fn progress(&self) -> SyncProgress {
        let chain_progress = *self.chain_progress.lock();
        let current_block = match *self.mode.lock() {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Fast => self.chain.current_fast_block().number,
            SyncMode::Offline => 0,
        };
        SyncProgress {
            starting_block: chain_progress.origin,
            current_block,
            highest_block: chain_progress.height,
            pulled_states: self.pulled_states.load(Ordering::Relaxed),
            known_states: self.known_states.load(Ordering::Relaxed),
        }
    }

    /// Runs one cycle against the peer. The caller holds the busy flag.
    async fn run_cycle(
        self: &Arc<Self>,
        peer_id: &PeerId,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> SyncResult<()> {
        let mode = if mode.is_fast() && self.fast_sync_disabled.load(Ordering::SeqCst) {
            info!(target: "downloaders::sync", "Fast sync disabled after a rollback, syncing in full");
            SyncMode::Full
        } else {
            mode
        };

        self.queue.reset();
        self.peers.reset();
        *self.mode.lock() = mode;
        self.pivot.store(0, Ordering::SeqCst);
        self.rolled_back.store(false, Ordering::SeqCst);

        let cancel = self.quit.child_token();
        let (senders, receivers) = delivery_channels();
        *self.cycle.lock() =
            Some(ActiveCycle { peer_id: peer_id.clone(), cancel: cancel.clone(), senders });
        let _cycle = CycleGuard { inner: self, cancel: cancel.clone() };

        let Some(peer) = self.peers.peer(peer_id) else { return Err(SyncError::UnknownPeer) };
        self.metrics.cycles_started.increment(1);
        let result = self.sync_with_peer(peer, head, td, mode, receivers, &cancel).await;

        // every task has exited at this point, the header processor included
        if let Err(err) = &result {
            if mode.is_fast() && !err.is_cancellation() && self.rolled_back.load(Ordering::SeqCst) {
                info!(target: "downloaders::sync", %err, "Fast sync failed after importing headers, disabling it");
                self.fast_sync_disabled.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    async fn sync_with_peer(
        self: &Arc<Self>,
        peer: Arc<PeerConnection>,
        head: B256,
        td: U256,
        mode: SyncMode,
        receivers: DeliveryReceivers,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let DeliveryReceivers { mut headers, bodies, receipts, node_data } = receivers;
        debug!(
            target: "downloaders::sync",
            peer_id = %peer.id(),
            version = peer.version(),
            %head,
            %td,
            %mode,
            "Synchronising with the network"
        );

        let latest = self.fetch_height(&peer, head, &mut headers, cancel).await?;
        let height = latest.number;
        let origin = AncestorLocator {
            chain: &*self.chain,
            peer: &peer,
            deliveries: &mut headers,
            cancel,
            max_header_fetch: self.config.max_header_fetch,
            max_fork_ancestry: self.config.max_fork_ancestry,
            ttl: self.peers.request_ttl(),
        }
        .find(height, mode)
        .await?;
        self.update_chain_progress(origin, height);
        self.metrics.highest_block.set(height as f64);

        let mut origin = origin;
        let mut pivot = 0;
        if mode.is_fast() {
            pivot = height.saturating_sub(self.config.fs_min_full_blocks);
            if pivot > 0 && pivot <= origin {
                origin = pivot - 1;
            }
        }
        self.pivot.store(pivot, Ordering::SeqCst);
        self.committed.store(!(mode.is_fast() && pivot != 0), Ordering::SeqCst);
        self.queue.prepare(origin + 1, mode);
        self.observer.on_sync_init(origin, height);
        debug!(target: "downloaders::sync", origin, height, pivot, "Starting content retrieval");

        let (processor_tx, processor_rx) = mpsc::channel(1);
        let (bodies_wake_tx, bodies_wake_rx) = mpsc::channel(1);
        let (receipts_wake_tx, receipts_wake_rx) = mpsc::channel(1);
        let wake = WakeSenders { bodies: bodies_wake_tx, receipts: receipts_wake_tx };

        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(self).fetch_headers(
            peer,
            origin + 1,
            headers,
            processor_tx,
            cancel.clone(),
        ));
        tasks.spawn(Arc::clone(self).fetch_bodies(bodies, bodies_wake_rx, cancel.clone()));
        tasks.spawn(Arc::clone(self).fetch_receipts(receipts, receipts_wake_rx, cancel.clone()));
        tasks.spawn(Arc::clone(self).process_headers(
            origin + 1,
            td,
            mode,
            processor_rx,
            wake,
            cancel.clone(),
        ));
        if mode.is_fast() {
            tasks.spawn(Arc::clone(self).process_fast_sync_content(
                latest,
                node_data,
                cancel.clone(),
            ));
        } else {
            tasks.spawn(Arc::clone(self).process_full_sync_content(cancel.clone()));
        }

        self.supervise(tasks, cancel).await
    }

    /// Waits for every task of the cycle.
    ///
    /// The queue is closed once all but the last task finished, which lets the content
    /// processor drain the remaining results and return. The first error cancels everything else.
    async fn supervise(
        &self,
        mut tasks: JoinSet<SyncResult<()>>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let total = tasks.len();
        let mut done = 0;
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            done += 1;
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                Err(_) => Err(SyncError::CancelBlockFetch),
            };
            if let Err(err) = result {
                if failure.is_none() {
                    debug!(target: "downloaders::sync", %err, "Sync task failed, cancelling cycle");
                    self.queue.close();
                    cancel.cancel();
                    failure = Some(err);
                }
            }
            if done + 1 == total {
                self.queue.close();
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

/// Synchronises the local chain with remote peers.
///
/// The handle is cheap to clone. Peers are registered by the protocol layer, which also routes
/// every response through the `deliver_*` methods. One sync cycle runs at a time.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

// === impl Downloader ===

impl Downloader {
    /// Returns a builder with the default configuration.
    pub fn builder() -> DownloaderBuilder {
        DownloaderBuilder::default()
    }

    /// Adds a peer speaking the given protocol version.
    pub fn register_peer(
        &self,
        id: PeerId,
        version: u32,
        peer: Arc<dyn SyncPeer>,
    ) -> Result<(), RegisterError> {
        trace!(target: "downloaders::peers", %id, version, "Registering sync peer");
        let connection = PeerConnection::new(id, version, peer, &self.inner.config);
        self.inner.peers.register(connection)?;
        Ok(())
    }

    /// Removes a peer, returning its outstanding work to the queue.
    ///
    /// Removing the peer a cycle runs against cancels that cycle. Unknown peers are ignored.
    pub fn unregister_peer(&self, id: &PeerId) {
        trace!(target: "downloaders::peers", %id, "Unregistering sync peer");
        self.inner.unregister(id);
    }

    /// Applies a reputation change to the peer, unregistering it once it is banned.
    pub fn report_peer(&self, id: &PeerId, kind: ReputationChangeKind) {
        self.inner.penalize(id, kind);
    }

    /// The registered peers.
    pub fn peers(&self) -> &PeerSet {
        &self.inner.peers
    }

    /// Runs a sync cycle against the peer, returning once the cycle completed or failed.
    ///
    /// `head` and `td` are the head hash and total difficulty the peer advertised. A returned
    /// error classifies via [`SyncError::should_drop_peer`] whether the peer is to blame, the
    /// downloader itself only drops peers that stopped answering content requests.
    pub async fn synchronise(
        &self,
        id: &PeerId,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.quit.is_cancelled() {
            return Err(SyncError::Terminated)
        }
        if mode == SyncMode::Offline {
            debug!(target: "downloaders::sync", %id, "Sync mode is offline, skipping");
            return Ok(())
        }
        let Some(_guard) = SyncGuard::acquire(&inner.synchronising) else {
            return Err(SyncError::Busy)
        };

        let result = inner.run_cycle(id, head, td, mode).await;
        match &result {
            Ok(()) => {
                inner.metrics.cycles_completed.increment(1);
                info!(target: "downloaders::sync", %id, "Synchronisation completed");
            }
            Err(err) => {
                inner.metrics.cycles_failed.increment(1);
                debug!(target: "downloaders::sync", %id, %err, "Synchronisation failed");
            }
        }
        result
    }

    /// Aborts the running cycle, if any.
    pub fn cancel(&self) {
        if let Some(cycle) = self.inner.cycle.lock().as_ref() {
            debug!(target: "downloaders::sync", peer_id = %cycle.peer_id, "Cancelling sync");
            cycle.cancel.cancel();
        }
    }

    /// Aborts the running cycle and refuses every future one.
    pub fn terminate(&self) {
        debug!(target: "downloaders::sync", "Terminating downloader");
        self.inner.quit.cancel();
    }

    /// Whether a cycle is running.
    pub fn synchronising(&self) -> bool {
        self.inner.synchronising.load(Ordering::SeqCst)
    }

    /// Snapshot of the progress of the running or last cycle.
    pub fn progress(&self) -> SyncProgress {
        self.inner.progress()
    }

    /// Hands a header response to the running cycle.
    pub fn deliver_headers(&self, id: &PeerId, headers: Vec<Header>) -> SyncResult<()> {
        let headers = headers.into_iter().map(Header::seal_slow).collect();
        self.inner.deliver(id, headers, |senders| &senders.headers)
    }

    /// Hands a body response to the running cycle.
    pub fn deliver_bodies(&self, id: &PeerId, bodies: Vec<BlockBody>) -> SyncResult<()> {
        self.inner.deliver(id, bodies, |senders| &senders.bodies)
    }

    /// Hands a receipt response to the running cycle.
    pub fn deliver_receipts(&self, id: &PeerId, receipts: Vec<Vec<Receipt>>) -> SyncResult<()> {
        self.inner.deliver(id, receipts, |senders| &senders.receipts)
    }

    /// Hands a state node response to the running cycle.
    pub fn deliver_node_data(&self, id: &PeerId, nodes: Vec<Bytes>) -> SyncResult<()> {
        self.inner.deliver(id, nodes, |senders| &senders.node_data)
    }
}

impl SyncStateProvider for Downloader {
    fn is_syncing(&self) -> bool {
        self.synchronising()
    }
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("peers", &self.inner.peers.len())
            .field("synchronising", &self.synchronising())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

/// Configures and builds a [`Downloader`].
#[derive(Debug)]
pub struct DownloaderBuilder {
    config: DownloaderConfig,
    observer: Arc<dyn SyncObserver>,
    weights: ReputationChangeWeights,
}

impl Default for DownloaderBuilder {
    fn default() -> Self {
        Self::new(DownloaderConfig::default())
    }
}

impl From<DownloaderConfig> for DownloaderBuilder {
    fn from(config: DownloaderConfig) -> Self {
        Self::new(config)
    }
}

impl DownloaderBuilder {
    /// Creates a builder with the given tuning.
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            observer: Arc::new(NoopObserver::default()),
            weights: ReputationChangeWeights::default(),
        }
    }

    /// Sets the hooks called during a cycle.
    pub fn observer(mut self, observer: impl SyncObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Sets the penalties applied to misbehaving peers.
    pub fn reputation_weights(mut self, weights: ReputationChangeWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Builds the downloader on top of the local chain and state database.
    pub fn build<C, S>(self, chain: C, state: S) -> Downloader
    where
        C: BlockChain + 'static,
        S: StateProvider + 'static,
    {
        let Self { config, observer, weights } = self;
        let inner = DownloaderInner {
            chain: Arc::new(chain),
            state: Arc::new(state),
            observer,
            peers: PeerSet::new(config).with_weights(weights),
            queue: ResultQueue::new(&config),
            cycle: Mutex::new(None),
            synchronising: AtomicBool::new(false),
            fast_sync_disabled: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
            mode: Mutex::new(SyncMode::Full),
            pivot: AtomicU64::new(0),
            committed: AtomicBool::new(true),
            chain_progress: Mutex::new(ChainProgress::default()),
            pulled_states: AtomicU64::new(0),
            known_states: AtomicU64::new(0),
            quit: CancellationToken::new(),
            metrics: SyncMetrics::default(),
            fetch_metrics: ContentMetrics::default(),
            config,
        };
        Downloader { inner: Arc::new(inner) }
    }
}
