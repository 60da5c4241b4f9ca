use super::blocks::TestBlocks;
use aqua_interfaces::p2p::{RequestError, RequestResult, SyncPeer};
use aqua_primitives::{
    BlockBody, BlockNumber, Bytes, Header, PeerId, Receipt, WithPeerId, B256, U256,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::mpsc;

/// A response of a [`TestSyncPeer`], to be handed to the downloader.
#[derive(Debug, Clone)]
pub enum PeerResponse {
    /// Headers answering a header request.
    Headers(Vec<Header>),
    /// Bodies answering a body request.
    Bodies(Vec<BlockBody>),
    /// Receipts answering a receipt request.
    Receipts(Vec<Vec<Receipt>>),
    /// State nodes answering a node request.
    NodeData(Vec<Bytes>),
}

/// Number of requests a [`TestSyncPeer`] received, per kind.
#[derive(Debug, Default)]
pub struct RequestCounts {
    /// Header requests.
    pub headers: AtomicUsize,
    /// Body requests.
    pub bodies: AtomicUsize,
    /// Receipt requests.
    pub receipts: AtomicUsize,
    /// State node requests.
    pub node_data: AtomicUsize,
}

/// Where a header request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOrigin {
    /// The header with the given hash.
    Hash(B256),
    /// The canonical header with the given number.
    Number(BlockNumber),
}

/// A header request received by a [`TestSyncPeer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRequest {
    /// First requested header.
    pub origin: HeaderOrigin,
    /// Maximum number of headers.
    pub amount: u64,
    /// Headers skipped between two returned ones.
    pub skip: u64,
    /// Whether the headers run towards genesis.
    pub reverse: bool,
}

/// A remote peer serving a [`TestBlocks`] chain.
///
/// Responses are computed on request and sent through a channel, whoever drains it is in charge
/// of handing them to the downloader.
#[derive(Debug)]
pub struct TestSyncPeer {
    id: PeerId,
    blocks: TestBlocks,
    responses: mpsc::UnboundedSender<WithPeerId<PeerResponse>>,
    /// Headers left out of every header response.
    withheld: Mutex<HashSet<BlockNumber>>,
    /// Headers from this number on are left out of every header response.
    withheld_from: Mutex<Option<BlockNumber>>,
    /// Whether requests are silently dropped.
    stalled: AtomicBool,
    /// Time between a request and its response.
    delay: Mutex<Duration>,
    /// Positions of the responses that are never sent, counted from one.
    dropped: Mutex<HashSet<usize>>,
    /// Responses produced so far, dropped ones included.
    responses_made: AtomicUsize,
    /// Header requests in the order they were received.
    header_requests: Mutex<Vec<HeaderRequest>>,
    /// Requests received so far.
    pub requests: RequestCounts,
}

impl TestSyncPeer {
    /// Creates a peer serving `blocks`.
    pub fn new(
        id: impl Into<PeerId>,
        blocks: TestBlocks,
        responses: mpsc::UnboundedSender<WithPeerId<PeerResponse>>,
    ) -> Self {
        Self {
            id: id.into(),
            blocks,
            responses,
            withheld: Default::default(),
            withheld_from: Default::default(),
            stalled: AtomicBool::new(false),
            delay: Default::default(),
            dropped: Default::default(),
            responses_made: AtomicUsize::new(0),
            header_requests: Default::default(),
            requests: RequestCounts::default(),
        }
    }

    /// The peer's id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The chain the peer serves.
    pub fn blocks(&self) -> &TestBlocks {
        &self.blocks
    }

    /// Leaves the header at `number` out of every header response.
    pub fn withhold_header(&self, number: BlockNumber) {
        self.withheld.lock().insert(number);
    }

    /// Leaves every header from `number` on out of header responses, as if the chain ended
    /// right before it.
    pub fn withhold_headers_from(&self, number: BlockNumber) {
        *self.withheld_from.lock() = Some(number);
    }

    /// Stops answering requests.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Never sends the `nth` response, counted from one over all kinds.
    pub fn drop_response(&self, nth: usize) {
        self.dropped.lock().insert(nth);
    }

    /// The header requests received so far.
    pub fn header_requests(&self) -> Vec<HeaderRequest> {
        self.header_requests.lock().clone()
    }

    fn respond(&self, response: PeerResponse) -> RequestResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(())
        }
        let nth = self.responses_made.fetch_add(1, Ordering::SeqCst) + 1;
        if self.dropped.lock().contains(&nth) {
            return Ok(())
        }

        let response = WithPeerId::new(self.id.clone(), response);
        let delay = *self.delay.lock();
        if delay.is_zero() {
            return self.responses.send(response).map_err(|_| RequestError::ChannelClosed)
        }
        if self.responses.is_closed() {
            return Err(RequestError::ChannelClosed)
        }
        let responses = self.responses.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = responses.send(response);
        });
        Ok(())
    }

    fn record_header_request(&self, origin: HeaderOrigin, amount: u64, skip: u64, reverse: bool) {
        self.requests.headers.fetch_add(1, Ordering::SeqCst);
        self.header_requests.lock().push(HeaderRequest { origin, amount, skip, reverse });
    }

    fn headers_from(
        &self,
        origin: BlockNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> Vec<Header> {
        let withheld = self.withheld.lock();
        let withheld_from = *self.withheld_from.lock();
        let mut headers = Vec::new();
        let mut number = Some(origin);
        while let Some(current) = number {
            if headers.len() as u64 >= amount {
                break
            }
            if withheld_from.is_some_and(|from| current >= from) {
                break
            }
            let Some(header) = self.blocks.header(current) else { break };
            if !withheld.contains(&current) {
                headers.push(header.unseal());
            }
            number = if reverse {
                current.checked_sub(skip + 1)
            } else {
                current.checked_add(skip + 1)
            };
        }
        headers
    }
}

impl SyncPeer for TestSyncPeer {
    fn head(&self) -> (B256, U256) {
        (self.blocks.head().hash(), self.blocks.total_difficulty())
    }

    fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> RequestResult<()> {
        self.record_header_request(HeaderOrigin::Hash(origin), amount, skip, reverse);
        let headers = match self.blocks.number(origin) {
            Some(number) => self.headers_from(number, amount, skip, reverse),
            None => Vec::new(),
        };
        self.respond(PeerResponse::Headers(headers))
    }

    fn request_headers_by_number(
        &self,
        origin: BlockNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> RequestResult<()> {
        self.record_header_request(HeaderOrigin::Number(origin), amount, skip, reverse);
        self.respond(PeerResponse::Headers(self.headers_from(origin, amount, skip, reverse)))
    }

    fn request_bodies(&self, hashes: Vec<B256>) -> RequestResult<()> {
        self.requests.bodies.fetch_add(1, Ordering::SeqCst);
        let bodies = hashes.into_iter().map_while(|hash| self.blocks.body(hash)).collect();
        self.respond(PeerResponse::Bodies(bodies))
    }

    fn request_receipts(&self, hashes: Vec<B256>) -> RequestResult<()> {
        self.requests.receipts.fetch_add(1, Ordering::SeqCst);
        let receipts = hashes.into_iter().map_while(|hash| self.blocks.receipts(hash)).collect();
        self.respond(PeerResponse::Receipts(receipts))
    }

    fn request_node_data(&self, hashes: Vec<B256>) -> RequestResult<()> {
        self.requests.node_data.fetch_add(1, Ordering::SeqCst);
        let nodes = hashes.into_iter().filter_map(|hash| self.blocks.node(hash)).collect();
        self.respond(PeerResponse::NodeData(nodes))
    }
}

/// A peer that accepts every request and never answers.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct NoopSyncPeer;

impl SyncPeer for NoopSyncPeer {
    fn head(&self) -> (B256, U256) {
        (B256::ZERO, U256::ZERO)
    }

    fn request_headers_by_hash(&self, _: B256, _: u64, _: u64, _: bool) -> RequestResult<()> {
        Ok(())
    }

    fn request_headers_by_number(
        &self,
        _: BlockNumber,
        _: u64,
        _: u64,
        _: bool,
    ) -> RequestResult<()> {
        Ok(())
    }

    fn request_bodies(&self, _: Vec<B256>) -> RequestResult<()> {
        Ok(())
    }

    fn request_receipts(&self, _: Vec<B256>) -> RequestResult<()> {
        Ok(())
    }

    fn request_node_data(&self, _: Vec<B256>) -> RequestResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn peer() -> (TestSyncPeer, mpsc::UnboundedReceiver<WithPeerId<PeerResponse>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TestSyncPeer::new("a", TestBlocks::genesis().extend(20, 0), tx), rx)
    }

    #[tokio::test]
    async fn dropped_responses_are_never_sent() {
        let (peer, mut rx) = peer();
        peer.drop_response(2);

        for origin in [1, 2, 3] {
            peer.request_headers_by_number(origin, 1, 0, false).unwrap();
        }
        let numbers = [rx.recv().await, rx.recv().await].map(|response| {
            match response.unwrap().into_data() {
                PeerResponse::Headers(headers) => headers[0].number,
                other => panic!("unexpected response {other:?}"),
            }
        });
        assert_eq!(numbers, [1, 3]);
        assert!(rx.try_recv().is_err());
        assert_eq!(peer.requests.headers.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn withheld_tail_ends_the_chain() {
        let (peer, mut rx) = peer();
        peer.withhold_headers_from(10);

        peer.request_headers_by_number(5, 10, 0, false).unwrap();
        assert_matches!(
            rx.recv().await.unwrap().into_data(),
            PeerResponse::Headers(headers) if headers.len() == 5
        );
        assert_eq!(
            peer.header_requests(),
            vec![HeaderRequest {
                origin: HeaderOrigin::Number(5),
                amount: 10,
                skip: 0,
                reverse: false
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_responses_arrive_late() {
        let (peer, mut rx) = peer();
        peer.set_delay(Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        peer.request_bodies(vec![peer.blocks().hash(3).unwrap()]).unwrap();
        assert!(rx.try_recv().is_err());
        assert_matches!(
            rx.recv().await.unwrap().into_data(),
            PeerResponse::Bodies(bodies) if bodies.len() == 1
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
