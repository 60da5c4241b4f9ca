//! Scheduling of block content retrieval and in order assembly of the results.
//!
//! Headers that passed the header processor are scheduled as body (and in fast sync receipt)
//! tasks. Peers reserve tasks in ascending block order, but only for blocks that fit into the
//! result window starting at the next block to be committed. Completed blocks are handed to the
//! content processor strictly in order and leave the window once they are committed.
//!
//! The queue also assembles skeleton fills: every skeleton header closes a batch of
//! `max_header_fetch` headers that is retrieved from whichever peer is idle.

use crate::peers::{ContentKind, PeerConnection};
use aqua_config::DownloaderConfig;
use aqua_interfaces::{p2p::SyncError, sync::SyncMode};
use aqua_primitives::{
    proofs, BlockBody, BlockNumber, PeerId, Receipt, SealedBlock, SealedHeader, B256,
};
use parking_lot::Mutex;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

/// The body of a result is still missing.
const BODY_PENDING: u8 = 1;
/// The receipts of a result are still missing.
const RECEIPTS_PENDING: u8 = 1 << 1;

/// Work handed to a single peer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The peer the request was assigned to.
    pub peer_id: PeerId,
    /// What is requested.
    pub kind: ContentKind,
    /// First block of the skeleton batch, only meaningful for header requests.
    pub from: BlockNumber,
    /// Blocks whose bodies or receipts are requested.
    pub headers: Vec<SealedHeader>,
    /// When the request was assigned.
    pub issued: Instant,
}

impl FetchRequest {
    /// Whether the request has been outstanding for longer than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued.elapsed() > ttl
    }
}

/// A block being assembled from its header, body and receipts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// The scheduled header.
    pub header: SealedHeader,
    /// Transactions and ommers.
    pub body: BlockBody,
    /// Receipts, only retrieved in fast sync.
    pub receipts: Vec<Receipt>,
    pending: u8,
}

// === impl FetchResult ===

impl FetchResult {
    fn new(header: SealedHeader, mode: SyncMode) -> Self {
        let mut pending = BODY_PENDING;
        if mode.is_fast() {
            pending |= RECEIPTS_PENDING;
        }
        Self { header, body: BlockBody::default(), receipts: Vec::new(), pending }
    }

    /// Block hash.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    /// Block number.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Whether every component of the block has arrived.
    pub fn is_ready(&self) -> bool {
        self.pending == 0
    }

    /// Assembles the block.
    pub fn into_block(self) -> SealedBlock {
        SealedBlock::new(self.header, self.body)
    }

    /// Assembles the block and hands out the receipts alongside.
    pub fn into_parts(self) -> (SealedBlock, Vec<Receipt>) {
        (SealedBlock::new(self.header, self.body), self.receipts)
    }
}

/// Outcome of reserving work for a peer.
#[derive(Debug, Default)]
pub struct Reservation {
    /// The request to send, if any work was assigned.
    pub request: Option<FetchRequest>,
    /// Whether results completed without a request, because their content is empty.
    pub progress: bool,
}

/// Why a delivery was not (fully) accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer has no outstanding request of this kind.
    #[error("no fetches pending")]
    NoFetchesPending,
    /// A skeleton fill did not connect to the skeleton.
    #[error("delivery not accepted")]
    NotAccepted,
    /// A result fell outside of the result window.
    #[error(transparent)]
    InvalidChain(SyncError),
    /// Nothing in the delivery could be used.
    #[error("stale delivery: {0}")]
    Stale(SyncError),
    /// Part of the delivery was used, the rest was invalid.
    #[error("partial failure after {0} items: {1}")]
    Partial(usize, SyncError),
}

/// Body or receipt tasks.
#[derive(Debug, Default)]
struct ContentTasks {
    /// Headers still waiting for their content, by hash.
    pool: HashMap<B256, SealedHeader>,
    /// Hashes to assign, lowest block first.
    queue: BinaryHeap<Reverse<(BlockNumber, B256)>>,
    /// Outstanding request per peer.
    pending: HashMap<PeerId, FetchRequest>,
    /// Completed hashes whose result was not handed off yet.
    done: HashSet<B256>,
}

impl ContentTasks {
    fn push(&mut self, header: SealedHeader) {
        self.queue.push(Reverse((header.number, header.hash())));
        self.pool.insert(header.hash(), header);
    }

    fn requeue(&mut self, header: &SealedHeader) {
        self.queue.push(Reverse((header.number, header.hash())));
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty() && self.done.is_empty()
    }
}

/// State of an ongoing skeleton fill.
#[derive(Debug, Default)]
struct HeaderFill {
    /// Skeleton header closing the batch that starts at the key.
    tasks: BTreeMap<BlockNumber, SealedHeader>,
    /// Batch starts left to assign.
    queue: BinaryHeap<Reverse<BlockNumber>>,
    /// Batch starts each peer failed to deliver.
    misses: HashMap<PeerId, HashSet<BlockNumber>>,
    /// Outstanding request per peer.
    pending: HashMap<PeerId, FetchRequest>,
    /// Filled headers, indexed from `offset`.
    results: Vec<Option<SealedHeader>>,
    /// Number of headers already forwarded to the header processor.
    proced: usize,
    offset: BlockNumber,
}

#[derive(Debug)]
struct QueueInner {
    mode: SyncMode,
    /// Hash of the last scheduled header, the next one has to build on it.
    header_head: Option<B256>,
    fill: HeaderFill,
    bodies: ContentTasks,
    receipts: ContentTasks,
    /// Results in block order, the front belongs to `result_offset`.
    results: VecDeque<Option<FetchResult>>,
    result_offset: BlockNumber,
    /// Leading results handed to the content processor but not committed yet.
    handed_off: usize,
    closed: bool,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            mode: SyncMode::Full,
            header_head: None,
            fill: HeaderFill::default(),
            bodies: ContentTasks::default(),
            receipts: ContentTasks::default(),
            results: VecDeque::new(),
            result_offset: 0,
            handed_off: 0,
            closed: false,
        }
    }

    fn content(&mut self, kind: ContentKind) -> Option<&mut ContentTasks> {
        match kind {
            ContentKind::Bodies => Some(&mut self.bodies),
            ContentKind::Receipts => Some(&mut self.receipts),
            ContentKind::Headers | ContentKind::NodeData => None,
        }
    }

    fn take_ready(&mut self, max: usize) -> Vec<FetchResult> {
        let mut ready = Vec::new();
        while ready.len() < max {
            let index = self.handed_off;
            let Some(slot) = self.results.get_mut(index) else { break };
            if !slot.as_ref().is_some_and(FetchResult::is_ready) {
                break
            }
            let Some(result) = slot.take() else { break };
            self.bodies.done.remove(&result.hash());
            self.receipts.done.remove(&result.hash());
            self.handed_off += 1;
            ready.push(result);
        }
        ready
    }
}

/// Whether the content of `kind` is known to be empty from the header alone.
fn is_noop(kind: ContentKind, header: &SealedHeader) -> bool {
    match kind {
        ContentKind::Bodies => header.has_empty_body(),
        ContentKind::Receipts => header.has_empty_receipts(),
        ContentKind::Headers | ContentKind::NodeData => false,
    }
}

const fn pending_bit(kind: ContentKind) -> u8 {
    match kind {
        ContentKind::Receipts => RECEIPTS_PENDING,
        _ => BODY_PENDING,
    }
}

/// Schedules block content retrieval and assembles the results in order.
///
/// At most `block_cache_items` results are held at any time: tasks for blocks beyond the window
/// are not handed out until the results in front of them are committed.
#[derive(Debug)]
pub struct ResultQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_header_fetch: u64,
    block_cache_items: usize,
    max_results_process: usize,
}

// === impl ResultQueue ===

impl ResultQueue {
    /// Creates an empty queue.
    pub fn new(config: &DownloaderConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::new()),
            notify: Notify::new(),
            max_header_fetch: config.max_header_fetch.max(1),
            block_cache_items: config.block_cache_items.max(1),
            max_results_process: config.max_results_process.max(1),
        }
    }

    /// Drops every task and result.
    pub fn reset(&self) {
        *self.inner.lock() = QueueInner::new();
        self.notify.notify_waiters();
    }

    /// Marks the queue as closed, waking up anyone waiting for results.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Sets the first block number of the result window and the mode of the cycle.
    pub fn prepare(&self, offset: BlockNumber, mode: SyncMode) {
        let mut inner = self.inner.lock();
        if inner.result_offset < offset {
            inner.result_offset = offset;
        }
        inner.mode = mode;
    }

    /// Whether nothing is queued, in flight or waiting to be handed off.
    pub fn idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.fill.tasks.is_empty() &&
            inner.fill.pending.is_empty() &&
            inner.bodies.is_idle() &&
            inner.receipts.is_idle() &&
            inner.results.iter().all(Option::is_none)
    }

    /// Number of tasks of `kind` waiting to be assigned.
    pub fn pending(&self, kind: ContentKind) -> usize {
        let mut inner = self.inner.lock();
        if kind == ContentKind::Headers {
            return inner.fill.queue.len()
        }
        inner.content(kind).map_or(0, |tasks| tasks.queue.len())
    }

    /// Whether any request of `kind` is outstanding.
    pub fn in_flight(&self, kind: ContentKind) -> bool {
        let mut inner = self.inner.lock();
        if kind == ContentKind::Headers {
            return !inner.fill.pending.is_empty()
        }
        inner.content(kind).is_some_and(|tasks| !tasks.pending.is_empty())
    }

    /// Whether the next task of `kind` lies beyond the result window.
    pub fn throttle(&self, kind: ContentKind) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let limit = inner.result_offset + self.block_cache_items as u64;
        inner
            .content(kind)
            .and_then(|tasks| tasks.queue.peek().map(|Reverse((number, _))| *number >= limit))
            .unwrap_or(false)
    }

    /// Number of result slots in use, including results handed off but not committed.
    pub fn cached_results(&self) -> usize {
        self.inner.lock().results.len()
    }

    /// First block number of the result window.
    pub fn result_offset(&self) -> BlockNumber {
        self.inner.lock().result_offset
    }

    /// Schedules content retrieval for a contiguous batch of headers starting at `from`.
    ///
    /// Stops at the first header that does not continue the previously scheduled chain and
    /// returns the number of headers scheduled.
    pub fn schedule(&self, headers: &[SealedHeader], from: BlockNumber) -> usize {
        let mut inner = self.inner.lock();
        let mut expected = from;
        let mut inserted = 0;
        for header in headers {
            let hash = header.hash();
            if header.number != expected {
                trace!(target: "downloaders::queue", number = header.number, expected, "Header broke chain ordering");
                break
            }
            if inner.header_head.is_some_and(|head| head != header.parent_hash) {
                trace!(target: "downloaders::queue", number = header.number, ?hash, "Header broke chain ancestry");
                break
            }
            if inner.bodies.pool.contains_key(&hash) {
                trace!(target: "downloaders::queue", number = header.number, ?hash, "Header already scheduled");
                continue
            }
            inner.bodies.push(header.clone());
            if inner.mode.is_fast() {
                inner.receipts.push(header.clone());
            }
            inner.header_head = Some(hash);
            expected += 1;
            inserted += 1;
        }
        inserted
    }

    /// Starts filling the gaps of a skeleton whose first batch begins at `from`.
    pub fn schedule_skeleton(&self, from: BlockNumber, skeleton: Vec<SealedHeader>) {
        let mut inner = self.inner.lock();
        let batch = self.max_header_fetch;
        let mut fill = HeaderFill {
            results: vec![None; skeleton.len() * batch as usize],
            offset: from,
            ..Default::default()
        };
        for (index, header) in skeleton.into_iter().enumerate() {
            let start = from + index as u64 * batch;
            fill.tasks.insert(start, header);
            fill.queue.push(Reverse(start));
        }
        trace!(target: "downloaders::queue", from, batches = fill.tasks.len(), "Scheduled skeleton fill");
        inner.fill = fill;
    }

    /// Assigns the next skeleton batch the peer has not failed before.
    pub fn reserve_headers(&self, peer: &PeerConnection) -> Option<FetchRequest> {
        let mut inner = self.inner.lock();
        let fill = &mut inner.fill;
        if fill.pending.contains_key(peer.id()) {
            return None
        }
        let misses = fill.misses.get(peer.id());
        let mut skipped = Vec::new();
        let mut assigned = None;
        while let Some(Reverse(from)) = fill.queue.pop() {
            if misses.is_some_and(|misses| misses.contains(&from)) {
                skipped.push(from);
                continue
            }
            assigned = Some(from);
            break
        }
        for from in skipped {
            fill.queue.push(Reverse(from));
        }
        let from = assigned?;
        let request = FetchRequest {
            peer_id: peer.id().clone(),
            kind: ContentKind::Headers,
            from,
            headers: Vec::new(),
            issued: Instant::now(),
        };
        fill.pending.insert(peer.id().clone(), request.clone());
        Some(request)
    }

    /// Reserves up to `count` body or receipt tasks for the peer.
    ///
    /// Tasks whose content is empty are completed on the spot and reported as progress. Tasks the
    /// peer failed to deliver before are left for other peers.
    pub fn reserve(
        &self,
        kind: ContentKind,
        peer: &PeerConnection,
        count: usize,
    ) -> Result<Reservation, SyncError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mode = inner.mode;
        let offset = inner.result_offset;
        let limit = self.block_cache_items;
        let results = &mut inner.results;
        let tasks = match kind {
            ContentKind::Bodies => &mut inner.bodies,
            ContentKind::Receipts => &mut inner.receipts,
            ContentKind::Headers | ContentKind::NodeData => return Ok(Reservation::default()),
        };
        if tasks.queue.is_empty() || tasks.pending.contains_key(peer.id()) {
            return Ok(Reservation::default())
        }

        let mut send = Vec::new();
        let mut skip = Vec::new();
        let mut progress = false;
        while send.len() < count {
            let Some(Reverse((number, hash))) = tasks.queue.peek().copied() else { break };
            if number < offset {
                trace!(target: "downloaders::queue", number, offset, "Task below result window");
                return Err(SyncError::InvalidChain)
            }
            let index = (number - offset) as usize;
            if index >= limit {
                break
            }
            tasks.queue.pop();
            let Some(header) = tasks.pool.get(&hash).cloned() else { continue };

            if results.len() <= index {
                results.resize_with(index + 1, || None);
            }
            let result =
                results[index].get_or_insert_with(|| FetchResult::new(header.clone(), mode));

            if is_noop(kind, &header) {
                result.pending &= !pending_bit(kind);
                tasks.pool.remove(&hash);
                tasks.done.insert(hash);
                progress = true;
                continue
            }
            if peer.lacks(&hash) {
                skip.push(Reverse((number, hash)));
                continue
            }
            send.push(header);
        }
        tasks.queue.extend(skip);

        let request = (!send.is_empty()).then(|| FetchRequest {
            peer_id: peer.id().clone(),
            kind,
            from: 0,
            headers: send,
            issued: Instant::now(),
        });
        if let Some(request) = &request {
            tasks.pending.insert(peer.id().clone(), request.clone());
        }
        drop(guard);

        if progress {
            self.notify.notify_waiters();
        }
        Ok(Reservation { request, progress })
    }

    /// Hands assigned work back to the task queue, used when a request could not be sent.
    pub fn cancel(&self, request: FetchRequest) {
        let mut inner = self.inner.lock();
        if request.kind == ContentKind::Headers {
            inner.fill.pending.remove(&request.peer_id);
            inner.fill.queue.push(Reverse(request.from));
            return
        }
        if let Some(tasks) = inner.content(request.kind) {
            tasks.pending.remove(&request.peer_id);
            for header in &request.headers {
                tasks.requeue(header);
            }
        }
    }

    /// Returns all work assigned to a peer that left.
    pub fn revoke(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(request) = inner.fill.pending.remove(peer_id) {
            inner.fill.queue.push(Reverse(request.from));
        }
        for kind in [ContentKind::Bodies, ContentKind::Receipts] {
            if let Some(tasks) = inner.content(kind) {
                if let Some(request) = tasks.pending.remove(peer_id) {
                    for header in &request.headers {
                        tasks.requeue(header);
                    }
                }
            }
        }
    }

    /// Returns the work of requests outstanding for longer than `ttl` to the task queue.
    ///
    /// The returned map holds the number of items each timed out peer failed to deliver.
    pub fn expire(&self, kind: ContentKind, ttl: Duration) -> HashMap<PeerId, usize> {
        let mut inner = self.inner.lock();
        let mut expired = HashMap::new();
        if kind == ContentKind::Headers {
            let fill = &mut inner.fill;
            let ids = fill
                .pending
                .iter()
                .filter(|(_, request)| request.is_expired(ttl))
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            for id in ids {
                if let Some(request) = fill.pending.remove(&id) {
                    fill.queue.push(Reverse(request.from));
                    expired.insert(id, 0);
                }
            }
            return expired
        }
        let Some(tasks) = inner.content(kind) else { return expired };
        let ids = tasks
            .pending
            .iter()
            .filter(|(_, request)| request.is_expired(ttl))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in ids {
            if let Some(request) = tasks.pending.remove(&id) {
                for header in &request.headers {
                    tasks.requeue(header);
                }
                expired.insert(id, request.headers.len());
            }
        }
        expired
    }

    /// Accepts a skeleton batch from the peer.
    ///
    /// The batch has to start at the requested number, be linked by parent hashes and end in
    /// the skeleton header. A rejected batch is never assigned to that peer again.
    pub fn deliver_headers(
        &self,
        peer: &PeerConnection,
        headers: Vec<SealedHeader>,
    ) -> Result<usize, DeliveryError> {
        let mut inner = self.inner.lock();
        let fill = &mut inner.fill;
        let Some(request) = fill.pending.remove(peer.id()) else {
            return Err(DeliveryError::NoFetchesPending)
        };
        let from = request.from;
        let Some(target) = fill.tasks.get(&from).map(SealedHeader::hash) else {
            return Err(DeliveryError::NoFetchesPending)
        };

        let start = (from - fill.offset) as usize;
        let accepted = headers.len() as u64 == self.max_header_fetch &&
            headers.first().map(|header| header.number) == Some(from) &&
            headers.last().map(SealedHeader::hash) == Some(target) &&
            headers.windows(2).all(|pair| {
                pair[1].number == pair[0].number + 1 && pair[1].parent_hash == pair[0].hash()
            }) &&
            start + headers.len() <= fill.results.len();
        if !accepted {
            trace!(target: "downloaders::queue", peer_id = %peer.id(), from, count = headers.len(), "Skeleton fill not accepted");
            fill.misses.entry(peer.id().clone()).or_default().insert(from);
            fill.queue.push(Reverse(from));
            return Err(DeliveryError::NotAccepted)
        }

        let count = headers.len();
        for (slot, header) in fill.results[start..start + count].iter_mut().zip(headers) {
            *slot = Some(header);
        }
        fill.tasks.remove(&from);
        Ok(count)
    }

    /// Takes the filled headers that connect to those already forwarded.
    pub fn take_ready_headers(&self) -> Vec<SealedHeader> {
        let mut inner = self.inner.lock();
        let fill = &mut inner.fill;
        let batch = self.max_header_fetch as usize;
        let mut ready = 0;
        while fill.proced + ready < fill.results.len() && fill.results[fill.proced + ready].is_some()
        {
            ready += batch;
        }
        let end = (fill.proced + ready).min(fill.results.len());
        let headers = fill.results[fill.proced..end].iter().flatten().cloned().collect();
        fill.proced = end;
        headers
    }

    /// Whether every skeleton batch has been filled.
    pub fn header_fill_done(&self) -> bool {
        self.inner.lock().fill.tasks.is_empty()
    }

    /// Ends the skeleton fill, returning the headers not forwarded yet and the number of headers
    /// forwarded during the fill.
    pub fn retrieve_headers(&self) -> (Vec<SealedHeader>, usize) {
        let mut inner = self.inner.lock();
        let mut fill = std::mem::take(&mut inner.fill);
        let proced = fill.proced;
        let headers = fill.results.drain(proced..).flatten().collect();
        (headers, proced)
    }

    /// Accepts block bodies from the peer.
    pub fn deliver_bodies(
        &self,
        peer: &PeerConnection,
        bodies: Vec<BlockBody>,
    ) -> Result<usize, DeliveryError> {
        self.deliver(ContentKind::Bodies, peer, bodies, |header, body, result| {
            if !body.matches_header(header) {
                return Err(SyncError::InvalidBody)
            }
            result.body = body;
            Ok(())
        })
    }

    /// Accepts block receipts from the peer.
    pub fn deliver_receipts(
        &self,
        peer: &PeerConnection,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, DeliveryError> {
        self.deliver(ContentKind::Receipts, peer, receipts, |header, receipts, result| {
            if proofs::calculate_receipt_root(&receipts) != header.receipts_root {
                return Err(SyncError::InvalidReceipt)
            }
            result.receipts = receipts;
            Ok(())
        })
    }

    /// Matches delivered items against the peer's outstanding request in order.
    ///
    /// Items that were not delivered, and every item after the first invalid one, go back to the
    /// task queue. An empty delivery marks all requested hashes as lacking at that peer.
    fn deliver<T>(
        &self,
        kind: ContentKind,
        peer: &PeerConnection,
        items: Vec<T>,
        reconstruct: impl Fn(&SealedHeader, T, &mut FetchResult) -> Result<(), SyncError>,
    ) -> Result<usize, DeliveryError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let offset = inner.result_offset;
        let results = &mut inner.results;
        let Some(tasks) = (match kind {
            ContentKind::Bodies => Some(&mut inner.bodies),
            ContentKind::Receipts => Some(&mut inner.receipts),
            _ => None,
        }) else {
            return Err(DeliveryError::NoFetchesPending)
        };
        let Some(request) = tasks.pending.remove(peer.id()) else {
            return Err(DeliveryError::NoFetchesPending)
        };
        if items.is_empty() {
            for header in &request.headers {
                peer.mark_lacking(header.hash());
            }
        }

        let mut items = items.into_iter();
        let mut accepted = 0;
        let mut failure = None;
        for header in request.headers {
            if failure.is_some() {
                tasks.requeue(&header);
                continue
            }
            let Some(item) = items.next() else {
                tasks.requeue(&header);
                continue
            };
            let slot = header
                .number
                .checked_sub(offset)
                .and_then(|index| results.get_mut(index as usize))
                .and_then(Option::as_mut);
            let Some(result) = slot else {
                failure = Some(SyncError::InvalidChain);
                tasks.requeue(&header);
                continue
            };
            if let Err(err) = reconstruct(&header, item, result) {
                failure = Some(err);
                tasks.requeue(&header);
                continue
            }
            result.pending &= !pending_bit(kind);
            tasks.pool.remove(&header.hash());
            tasks.done.insert(header.hash());
            accepted += 1;
        }
        drop(guard);

        if accepted > 0 {
            self.notify.notify_waiters();
        }
        match failure {
            None => Ok(accepted),
            Some(SyncError::InvalidChain) => Err(DeliveryError::InvalidChain(SyncError::InvalidChain)),
            Some(err) if accepted > 0 => Err(DeliveryError::Partial(accepted, err)),
            Some(err) => Err(DeliveryError::Stale(err)),
        }
    }

    /// Takes the completed results at the front of the window without waiting.
    ///
    /// Taken results stay in the window until they are [committed](Self::commit).
    pub fn take_ready(&self) -> Vec<FetchResult> {
        self.inner.lock().take_ready(self.max_results_process)
    }

    /// Waits until completed results are available at the front of the window and takes them.
    ///
    /// Returns an empty batch once the queue is closed and nothing is left to hand off.
    pub async fn results(&self) -> Vec<FetchResult> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                let ready = inner.take_ready(self.max_results_process);
                if !ready.is_empty() || inner.closed {
                    return ready
                }
            }
            notified.await;
        }
    }

    /// Releases the first `count` handed off results after they were inserted into the chain,
    /// moving the window forward.
    pub fn commit(&self, count: usize) {
        let mut inner = self.inner.lock();
        let count = count.min(inner.handed_off);
        inner.results.drain(..count);
        inner.result_offset += count as u64;
        inner.handed_off -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{NoopSyncPeer, TestBlocks};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn config() -> DownloaderConfig {
        DownloaderConfig {
            block_cache_items: 8,
            max_header_fetch: 4,
            max_results_process: 64,
            ..Default::default()
        }
    }

    fn peer(id: &str) -> PeerConnection {
        PeerConnection::new(id.into(), 63, Arc::new(NoopSyncPeer::default()), &config())
    }

    fn headers(blocks: &TestBlocks) -> Vec<SealedHeader> {
        blocks.headers().into_iter().skip(1).collect()
    }

    fn bodies(blocks: &TestBlocks, request: &FetchRequest) -> Vec<BlockBody> {
        request.headers.iter().map(|header| blocks.body(header.hash()).unwrap()).collect()
    }

    #[test]
    fn schedule_requires_continuity() {
        let blocks = TestBlocks::genesis().extend(10, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Full);

        let headers = headers(&blocks);
        assert_eq!(queue.schedule(&headers[..5], 2), 0);
        assert_eq!(queue.schedule(&headers[..5], 1), 5);
        assert_eq!(queue.schedule(&headers[6..], 7), 0);
        assert_eq!(queue.schedule(&headers[5..], 6), 5);
        assert_eq!(queue.pending(ContentKind::Bodies), 10);
        assert_eq!(queue.pending(ContentKind::Receipts), 0);
    }

    #[test]
    fn reservations_stay_within_window() {
        let blocks = TestBlocks::genesis().extend(20, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);

        let peer = peer("a");
        let reservation = queue.reserve(ContentKind::Bodies, &peer, 100).unwrap();
        let request = reservation.request.unwrap();
        assert!(reservation.progress);
        assert!(request.headers.iter().all(|header| header.number <= 8));
        assert!(request.headers.iter().all(|header| !header.has_empty_body()));
        assert!(queue.throttle(ContentKind::Bodies));
        assert_eq!(queue.cached_results(), 8);

        let accepted = queue.deliver_bodies(&peer, bodies(&blocks, &request)).unwrap();
        assert_eq!(accepted, request.headers.len());

        let ready = queue.take_ready();
        assert_eq!(ready.iter().map(FetchResult::number).collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());
        assert!(queue.take_ready().is_empty());

        // nothing moves until the batch is committed
        assert!(queue.throttle(ContentKind::Bodies));
        assert_eq!(queue.result_offset(), 1);
        queue.commit(ready.len());
        assert_eq!(queue.result_offset(), 9);
        assert!(!queue.throttle(ContentKind::Bodies));
        assert_eq!(queue.cached_results(), 0);
    }

    #[test]
    fn empty_content_needs_no_request() {
        let blocks = TestBlocks::genesis().extend_empty(6, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Fast);
        queue.schedule(&headers(&blocks), 1);

        let peer = peer("a");
        let bodies = queue.reserve(ContentKind::Bodies, &peer, 10).unwrap();
        assert!(bodies.request.is_none());
        assert!(bodies.progress);
        assert!(queue.take_ready().is_empty());

        let receipts = queue.reserve(ContentKind::Receipts, &peer, 10).unwrap();
        assert!(receipts.request.is_none());
        assert_eq!(queue.take_ready().len(), 6);
    }

    #[test]
    fn invalid_bodies_are_requeued() {
        let blocks = TestBlocks::genesis().extend(12, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);
        let peer = peer("a");

        let request = queue.reserve(ContentKind::Bodies, &peer, 2).unwrap().request.unwrap();
        assert_eq!(request.headers.len(), 2);
        let pending = queue.pending(ContentKind::Bodies);

        let junk = vec![BlockBody::default(); 2];
        assert_matches!(
            queue.deliver_bodies(&peer, junk),
            Err(DeliveryError::Stale(SyncError::InvalidBody))
        );
        assert_eq!(queue.pending(ContentKind::Bodies), pending + 2);
        assert!(!queue.in_flight(ContentKind::Bodies));

        // the first body is fine, the second is junk
        let request = queue.reserve(ContentKind::Bodies, &peer, 2).unwrap().request.unwrap();
        let mut delivery = bodies(&blocks, &request);
        delivery[1] = BlockBody::default();
        assert_matches!(
            queue.deliver_bodies(&peer, delivery),
            Err(DeliveryError::Partial(1, SyncError::InvalidBody))
        );
        assert_eq!(queue.pending(ContentKind::Bodies), pending + 1);
    }

    #[test]
    fn invalid_receipts_are_rejected() {
        let blocks = TestBlocks::genesis().extend(12, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Fast);
        queue.schedule(&headers(&blocks), 1);
        let peer = peer("a");

        let request = queue.reserve(ContentKind::Receipts, &peer, 1).unwrap().request.unwrap();
        assert_matches!(
            queue.deliver_receipts(&peer, vec![vec![Receipt::default()]]),
            Err(DeliveryError::Stale(SyncError::InvalidReceipt))
        );

        let request = queue
            .reserve(ContentKind::Receipts, &peer, 1)
            .unwrap()
            .request
            .unwrap_or(request);
        let receipts = request
            .headers
            .iter()
            .map(|header| blocks.receipts(header.hash()).unwrap())
            .collect();
        assert_eq!(queue.deliver_receipts(&peer, receipts), Ok(1));
    }

    #[test]
    fn empty_delivery_marks_lacking() {
        let blocks = TestBlocks::genesis().extend(12, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);
        let a = peer("a");
        let b = peer("b");

        let request = queue.reserve(ContentKind::Bodies, &a, 1).unwrap().request.unwrap();
        let hash = request.headers[0].hash();
        assert_eq!(queue.deliver_bodies(&a, vec![]), Ok(0));
        assert!(a.lacks(&hash));

        let retry = queue.reserve(ContentKind::Bodies, &a, 1).unwrap().request.unwrap();
        assert_ne!(retry.headers[0].hash(), hash);
        let other = queue.reserve(ContentKind::Bodies, &b, 1).unwrap().request.unwrap();
        assert_eq!(other.headers[0].hash(), hash);

        assert_eq!(queue.deliver_bodies(&b, vec![]), Ok(0));
        assert_matches!(queue.deliver_bodies(&b, vec![]), Err(DeliveryError::NoFetchesPending));
    }

    #[test]
    fn expire_and_revoke_return_work() {
        let blocks = TestBlocks::genesis().extend(12, 0);
        let queue = ResultQueue::new(&config());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);
        let a = peer("a");
        let b = peer("b");

        let request = queue.reserve(ContentKind::Bodies, &a, 2).unwrap().request.unwrap();
        let pending = queue.pending(ContentKind::Bodies) + request.headers.len();
        assert!(queue.expire(ContentKind::Bodies, Duration::from_secs(60)).is_empty());
        let expired = queue.expire(ContentKind::Bodies, Duration::ZERO);
        assert_eq!(expired.get(a.id()), Some(&request.headers.len()));
        assert_eq!(queue.pending(ContentKind::Bodies), pending);

        queue.reserve(ContentKind::Bodies, &b, 2).unwrap().request.unwrap();
        assert!(queue.in_flight(ContentKind::Bodies));
        queue.revoke(b.id());
        assert!(!queue.in_flight(ContentKind::Bodies));
        assert_eq!(queue.pending(ContentKind::Bodies), pending);
    }

    #[test]
    fn skeleton_fill() {
        let blocks = TestBlocks::genesis().extend(8, 0);
        let headers = headers(&blocks);
        let queue = ResultQueue::new(&config());
        let skeleton = vec![headers[3].clone(), headers[7].clone()];
        queue.schedule_skeleton(1, skeleton);
        assert_eq!(queue.pending(ContentKind::Headers), 2);

        let a = peer("a");
        let b = peer("b");
        let first = queue.reserve_headers(&a).unwrap();
        assert_eq!(first.from, 1);
        assert!(queue.reserve_headers(&a).is_none());
        let second = queue.reserve_headers(&b).unwrap();
        assert_eq!(second.from, 5);

        // a batch that does not end in the skeleton header is refused
        assert_eq!(
            queue.deliver_headers(&b, headers[3..7].to_vec()),
            Err(DeliveryError::NotAccepted)
        );
        assert!(queue.take_ready_headers().is_empty());

        assert_eq!(queue.deliver_headers(&a, headers[..4].to_vec()), Ok(4));
        assert_eq!(queue.take_ready_headers(), headers[..4].to_vec());

        // b never gets the batch it failed again
        assert!(queue.reserve_headers(&b).is_none());
        let retry = queue.reserve_headers(&a).unwrap();
        assert_eq!(retry.from, 5);
        assert_eq!(queue.deliver_headers(&a, headers[4..].to_vec()), Ok(4));
        assert!(queue.header_fill_done());

        let (rest, proced) = queue.retrieve_headers();
        assert_eq!(proced, 4);
        assert_eq!(rest, headers[4..].to_vec());
    }

    #[test]
    fn idle_after_reset() {
        let blocks = TestBlocks::genesis().extend(4, 0);
        let queue = ResultQueue::new(&config());
        assert!(queue.idle());
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);
        assert!(!queue.idle());
        queue.reset();
        assert!(queue.idle());
        assert_eq!(queue.result_offset(), 0);
    }

    #[tokio::test]
    async fn results_wait_until_closed() {
        let queue = Arc::new(ResultQueue::new(&config()));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.results().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn results_wake_on_delivery() {
        let blocks = TestBlocks::genesis().extend(3, 0);
        let queue = Arc::new(ResultQueue::new(&config()));
        queue.prepare(1, SyncMode::Full);
        queue.schedule(&headers(&blocks), 1);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.results().await })
        };
        let peer = peer("a");
        let request = queue.reserve(ContentKind::Bodies, &peer, 10).unwrap().request.unwrap();
        queue.deliver_bodies(&peer, bodies(&blocks, &request)).unwrap();

        let ready = waiter.await.unwrap();
        assert_eq!(ready.len(), 3);
        assert!(ready.iter().all(FetchResult::is_ready));
    }
}
