//! The set of peers a sync cycle can fetch from, with per peer throughput and latency tracking.

use crate::{
    cache::LruCache,
    reputation::{
        is_banned_reputation, Reputation, ReputationChangeKind, ReputationChangeWeights,
        DEFAULT_REPUTATION,
    },
};
use aqua_config::DownloaderConfig;
use aqua_interfaces::p2p::{PeerCapabilities, RequestError, RequestResult, SyncPeer};
use aqua_primitives::{BlockNumber, PeerId, SealedHeader, B256, U256};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::trace;

/// Maximum number of block hashes remembered as known by a peer.
const MAX_KNOWN_BLOCKS: usize = 1024;

/// Maximum number of transaction hashes remembered as known by a peer.
const MAX_KNOWN_TXS: usize = 32768;

/// Maximum number of banned peers remembered.
const MAX_BANNED_PEERS: usize = 1024;

/// The kinds of data fetched from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Block headers.
    Headers,
    /// Block bodies.
    Bodies,
    /// Block receipts.
    Receipts,
    /// State trie nodes.
    NodeData,
}

impl ContentKind {
    /// All content kinds.
    pub const ALL: [ContentKind; 4] =
        [ContentKind::Headers, ContentKind::Bodies, ContentKind::Receipts, ContentKind::NodeData];

    const fn index(self) -> usize {
        self as usize
    }

    /// Returns the name used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Headers => "headers",
            ContentKind::Bodies => "bodies",
            ContentKind::Receipts => "receipts",
            ContentKind::NodeData => "node_data",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerStats {
    /// Items per second, per content kind.
    throughput: [f64; 4],
    /// When the outstanding request of each kind was issued.
    started: [Option<Instant>; 4],
    /// Request round trip estimate.
    rtt: Duration,
}

/// A registered peer together with the bookkeeping the downloader keeps for it.
///
/// A peer serves at most one request per [`ContentKind`] at a time. Throughput and round trip
/// time are exponential moving averages over completed requests and decide how much work the peer
/// gets handed next.
pub struct PeerConnection {
    id: PeerId,
    version: u32,
    capabilities: PeerCapabilities,
    peer: Arc<dyn SyncPeer>,
    busy: [AtomicBool; 4],
    stats: Mutex<PeerStats>,
    /// Hashes the peer failed to deliver, never requested from it again.
    lacking: Mutex<LruCache<B256>>,
    known_blocks: Mutex<LruCache<B256>>,
    known_txs: Mutex<LruCache<B256>>,
    reputation: AtomicI32,
    measurement_impact: f64,
    max_fetch: [usize; 4],
}

// === impl PeerConnection ===

impl PeerConnection {
    /// Wraps a remote peer speaking the given protocol version.
    pub fn new(
        id: PeerId,
        version: u32,
        peer: Arc<dyn SyncPeer>,
        config: &DownloaderConfig,
    ) -> Self {
        Self {
            id,
            version,
            capabilities: PeerCapabilities::from_version(version),
            peer,
            busy: Default::default(),
            stats: Mutex::new(PeerStats {
                throughput: [0.0; 4],
                started: [None; 4],
                rtt: config.rtt_max_estimate,
            }),
            lacking: Mutex::new(LruCache::with_limit(config.max_lacking_hashes)),
            known_blocks: Mutex::new(LruCache::with_limit(MAX_KNOWN_BLOCKS)),
            known_txs: Mutex::new(LruCache::with_limit(MAX_KNOWN_TXS)),
            reputation: AtomicI32::new(DEFAULT_REPUTATION),
            measurement_impact: config.measurement_impact,
            max_fetch: [
                config.max_header_fetch as usize,
                config.max_block_fetch,
                config.max_receipt_fetch,
                config.max_state_fetch,
            ],
        }
    }

    /// The peer's identifier.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Messages the peer serves.
    pub fn capabilities(&self) -> PeerCapabilities {
        self.capabilities
    }

    /// The advertised head hash and total difficulty.
    pub fn head(&self) -> (B256, U256) {
        self.peer.head()
    }

    /// Whether the peer can serve the given content at all.
    pub fn supports(&self, kind: ContentKind) -> bool {
        match kind {
            ContentKind::Headers | ContentKind::Bodies => true,
            ContentKind::Receipts => self.capabilities.supports_receipts,
            ContentKind::NodeData => self.capabilities.supports_node_data,
        }
    }

    /// Direct access to the remote peer, bypassing the per kind request slots.
    pub(crate) fn client(&self) -> &dyn SyncPeer {
        &*self.peer
    }

    /// Clears request slots, throughput and lacking hashes ahead of a new sync cycle.
    pub fn reset(&self) {
        for busy in &self.busy {
            busy.store(false, Ordering::SeqCst);
        }
        {
            let mut stats = self.stats.lock();
            stats.throughput = [0.0; 4];
            stats.started = [None; 4];
        }
        self.lacking.lock().clear();
    }

    /// Requests a contiguous batch of headers used to fill a skeleton slot.
    pub fn fetch_headers(&self, from: BlockNumber, count: u64) -> RequestResult<()> {
        self.request(ContentKind::Headers, || {
            self.peer.request_headers_by_number(from, count, 0, false)
        })
    }

    /// Requests the bodies of the given headers.
    pub fn fetch_bodies(&self, headers: &[SealedHeader]) -> RequestResult<()> {
        self.request(ContentKind::Bodies, || {
            self.peer.request_bodies(headers.iter().map(SealedHeader::hash).collect())
        })
    }

    /// Requests the receipts of the given headers.
    pub fn fetch_receipts(&self, headers: &[SealedHeader]) -> RequestResult<()> {
        self.request(ContentKind::Receipts, || {
            self.peer.request_receipts(headers.iter().map(SealedHeader::hash).collect())
        })
    }

    /// Requests state trie nodes.
    pub fn fetch_node_data(&self, hashes: Vec<B256>) -> RequestResult<()> {
        self.request(ContentKind::NodeData, || self.peer.request_node_data(hashes))
    }

    /// Claims the request slot of `kind` and issues the request, releasing the slot again if the
    /// request could not be sent.
    fn request(
        &self,
        kind: ContentKind,
        send: impl FnOnce() -> RequestResult<()>,
    ) -> RequestResult<()> {
        if !self.supports(kind) {
            return Err(RequestError::UnsupportedCapability)
        }
        if self.busy[kind.index()]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RequestError::AlreadyFetching)
        }
        self.stats.lock().started[kind.index()] = Some(Instant::now());
        if let Err(err) = send() {
            self.stats.lock().started[kind.index()] = None;
            self.busy[kind.index()].store(false, Ordering::SeqCst);
            return Err(err)
        }
        Ok(())
    }

    /// Releases the request slot of `kind`, folding the delivery into the throughput and round
    /// trip estimates.
    ///
    /// A delivery of zero items drops the throughput to zero so the peer is tried last.
    pub fn set_idle(&self, kind: ContentKind, delivered: usize) {
        let index = kind.index();
        {
            let mut stats = self.stats.lock();
            if let Some(started) = stats.started[index].take() {
                if delivered == 0 {
                    stats.throughput[index] = 0.0;
                } else {
                    let elapsed = started.elapsed() + Duration::from_nanos(1);
                    let measured = delivered as f64 / elapsed.as_secs_f64();
                    let impact = self.measurement_impact;
                    stats.throughput[index] =
                        (1.0 - impact) * stats.throughput[index] + impact * measured;
                    stats.rtt = Duration::from_secs_f64(
                        (1.0 - impact) * stats.rtt.as_secs_f64() + impact * elapsed.as_secs_f64(),
                    );
                }
            }
        }
        self.busy[index].store(false, Ordering::SeqCst);
    }

    /// Whether no request of `kind` is outstanding.
    pub fn is_idle(&self, kind: ContentKind) -> bool {
        !self.busy[kind.index()].load(Ordering::SeqCst)
    }

    /// Estimated items per second for `kind`.
    pub fn throughput(&self, kind: ContentKind) -> f64 {
        self.stats.lock().throughput[kind.index()]
    }

    fn seed_throughput(&self, throughput: [f64; 4]) {
        self.stats.lock().throughput = throughput;
    }

    /// Estimated request round trip time.
    pub fn rtt(&self) -> Duration {
        self.stats.lock().rtt
    }

    /// Number of items of `kind` the peer is expected to deliver within `target_rtt`, at least two
    /// and at most the configured fetch limit.
    pub fn capacity(&self, kind: ContentKind, target_rtt: Duration) -> usize {
        let expected = (self.throughput(kind) * target_rtt.as_secs_f64()).max(1.0);
        let max = self.max_fetch[kind.index()].max(1);
        ((1.0 + expected) as usize).min(max)
    }

    /// Remembers that the peer did not deliver the item.
    pub fn mark_lacking(&self, hash: B256) {
        self.lacking.lock().insert(hash);
    }

    /// Whether the peer failed to deliver the item before.
    pub fn lacks(&self, hash: &B256) -> bool {
        self.lacking.lock().contains(hash)
    }

    /// Remembers that the peer knows the block.
    pub fn mark_block(&self, hash: B256) {
        self.known_blocks.lock().insert(hash);
    }

    /// Remembers that the peer knows the transaction.
    pub fn mark_transaction(&self, hash: B256) {
        self.known_txs.lock().insert(hash);
    }

    /// Whether the peer is known to have the block.
    pub fn knows_block(&self, hash: &B256) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    /// Whether the peer is known to have the transaction.
    pub fn knows_transaction(&self, hash: &B256) -> bool {
        self.known_txs.lock().contains(hash)
    }

    /// Current reputation.
    pub fn reputation(&self) -> Reputation {
        self.reputation.load(Ordering::SeqCst)
    }

    fn apply_reputation_change(&self, kind: ReputationChangeKind, weights: &ReputationChangeWeights) {
        if kind.is_reset() {
            self.reputation.store(DEFAULT_REPUTATION, Ordering::SeqCst);
            return
        }
        let change = weights.change(kind);
        let _ = self.reputation.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_add(change))
        });
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("reputation", &self.reputation())
            .finish_non_exhaustive()
    }
}

/// Errors returned by the [`PeerSet`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerSetError {
    /// A peer with the same id is already registered.
    #[error("peer {0} is already registered")]
    AlreadyRegistered(PeerId),
    /// The peer was banned.
    #[error("peer {0} is banned")]
    Banned(PeerId),
    /// No peer with that id is registered.
    #[error("peer {0} is not registered")]
    NotRegistered(PeerId),
}

/// The active peers of the downloader.
#[derive(Debug)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    banned: Mutex<LruCache<PeerId>>,
    weights: ReputationChangeWeights,
    config: DownloaderConfig,
}

// === impl PeerSet ===

impl PeerSet {
    /// Creates an empty set.
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            peers: Default::default(),
            banned: Mutex::new(LruCache::with_limit(MAX_BANNED_PEERS)),
            weights: ReputationChangeWeights::default(),
            config,
        }
    }

    /// Sets the reputation weights.
    pub fn with_weights(mut self, weights: ReputationChangeWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Adds a peer.
    ///
    /// The new peer starts with the average throughput of the existing peers so it gets a fair
    /// share of work before its own measurements come in.
    pub fn register(&self, peer: PeerConnection) -> Result<Arc<PeerConnection>, PeerSetError> {
        if self.is_banned(peer.id()) {
            return Err(PeerSetError::Banned(peer.id().clone()))
        }
        let mut peers = self.peers.write();
        if peers.contains_key(peer.id()) {
            return Err(PeerSetError::AlreadyRegistered(peer.id().clone()))
        }
        if !peers.is_empty() {
            let mut throughput = [0.0; 4];
            for existing in peers.values() {
                for kind in ContentKind::ALL {
                    throughput[kind.index()] += existing.throughput(kind);
                }
            }
            for value in &mut throughput {
                *value /= peers.len() as f64;
            }
            peer.seed_throughput(throughput);
        }
        let peer = Arc::new(peer);
        peers.insert(peer.id().clone(), peer.clone());
        trace!(target: "downloaders::peers", peer_id = %peer.id(), version = peer.version(), "Registered peer");
        Ok(peer)
    }

    /// Removes a peer.
    pub fn unregister(&self, id: &PeerId) -> Result<Arc<PeerConnection>, PeerSetError> {
        let removed = self.peers.write().remove(id);
        match removed {
            Some(peer) => {
                trace!(target: "downloaders::peers", peer_id = %id, "Unregistered peer");
                Ok(peer)
            }
            None => Err(PeerSetError::NotRegistered(id.clone())),
        }
    }

    /// Looks up a registered peer.
    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(id).cloned()
    }

    /// Whether the peer is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Every registered peer.
    pub fn all_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().cloned().collect()
    }

    /// Resets the bookkeeping of every peer.
    pub fn reset(&self) {
        for peer in self.peers.read().values() {
            peer.reset();
        }
    }

    /// Returns the peers able to take a request of `kind` right now, fastest first, together with
    /// the number of peers that serve `kind` at all.
    pub fn idle_peers(&self, kind: ContentKind) -> (Vec<Arc<PeerConnection>>, usize) {
        let peers = self.peers.read();
        let mut total = 0;
        let mut idle = Vec::new();
        for peer in peers.values().filter(|peer| peer.supports(kind)) {
            total += 1;
            if peer.is_idle(kind) {
                idle.push(peer.clone());
            }
        }
        drop(peers);
        idle.sort_by(|a, b| b.throughput(kind).total_cmp(&a.throughput(kind)));
        (idle, total)
    }

    /// Peers not known to have the block.
    pub fn peers_without_block(&self, hash: &B256) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().filter(|peer| !peer.knows_block(hash)).cloned().collect()
    }

    /// Peers not known to have the transaction.
    pub fn peers_without_transaction(&self, hash: &B256) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().filter(|peer| !peer.knows_transaction(hash)).cloned().collect()
    }

    /// The peer advertising the highest total difficulty.
    pub fn best_peer(&self) -> Option<Arc<PeerConnection>> {
        self.peers.read().values().max_by_key(|peer| peer.head().1).cloned()
    }

    /// Median round trip time of the best connected peers, clamped to the configured estimates.
    pub fn median_rtt(&self) -> Duration {
        let mut rtts = self.peers.read().values().map(|peer| peer.rtt()).collect::<Vec<_>>();
        rtts.sort_unstable();

        let tuning_peers = self.config.qos_tuning_peers;
        let median = if tuning_peers > 0 && tuning_peers <= rtts.len() {
            rtts[tuning_peers / 2]
        } else if !rtts.is_empty() {
            rtts[rtts.len() / 2]
        } else {
            self.config.rtt_max_estimate
        };
        median.max(self.config.rtt_min_estimate).min(self.config.rtt_max_estimate)
    }

    /// Round trip time to size requests for.
    pub fn request_rtt(&self) -> Duration {
        self.median_rtt() * 9 / 10
    }

    /// How long an outstanding request may take before it is expired.
    pub fn request_ttl(&self) -> Duration {
        (self.median_rtt() * self.config.ttl_scaling).min(self.config.ttl_limit)
    }

    /// Applies a reputation change to the peer.
    ///
    /// Returns `true` if the peer dropped below the ban threshold; it is then refused on
    /// registration until the ban is lifted.
    pub fn report(&self, id: &PeerId, kind: ReputationChangeKind) -> bool {
        let Some(peer) = self.peer(id) else { return self.is_banned(id) };
        peer.apply_reputation_change(kind, &self.weights);
        let reputation = peer.reputation();
        trace!(target: "downloaders::peers", peer_id = %id, ?kind, reputation, "Applied reputation change");
        if is_banned_reputation(reputation) {
            self.ban(id.clone());
            return true
        }
        false
    }

    /// Refuses the peer on future registrations.
    pub fn ban(&self, id: PeerId) {
        self.banned.lock().insert(id);
    }

    /// Whether the peer is banned.
    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.banned.lock().contains(id)
    }
}
