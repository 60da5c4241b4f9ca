use super::*;
use crate::{
    ancestor::ANCESTOR_SPACING,
    test_utils::{HeaderOrigin, HeaderRequest, PeerResponse, TestBlocks, TestChain, TestSyncPeer},
};
use assert_matches::assert_matches;
use std::{
    sync::atomic::AtomicUsize,
    time::{Duration, Instant},
};

/// Small limits so that a few hundred blocks exercise skeletons, throttling and the pivot.
fn test_config() -> DownloaderConfig {
    DownloaderConfig {
        max_fork_ancestry: 1000,
        block_cache_items: 128,
        max_header_fetch: 32,
        max_skeleton_size: 8,
        max_block_fetch: 16,
        max_receipt_fetch: 16,
        max_state_fetch: 32,
        max_headers_process: 64,
        max_results_process: 64,
        max_queued_headers: 1024,
        fs_header_check_frequency: 10,
        fs_header_safety_net: 64,
        fs_header_force_verify: 4,
        fs_header_cont_check: Duration::from_millis(20),
        fs_min_full_blocks: 16,
        rtt_min_estimate: Duration::from_millis(300),
        rtt_max_estimate: Duration::from_millis(500),
        ttl_scaling: 3,
        ttl_limit: Duration::from_secs(1),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct RecordingObserver {
    inits: Mutex<Vec<(BlockNumber, BlockNumber)>>,
    inserted: Mutex<Vec<BlockNumber>>,
    body_requests: AtomicUsize,
    /// Peer whose chain is cut short once the next cycle has located its ancestor.
    cut_on_init: Mutex<Option<(Arc<TestSyncPeer>, BlockNumber)>>,
}

impl SyncObserver for RecordingObserver {
    fn on_sync_init(&self, origin: BlockNumber, height: BlockNumber) {
        self.inits.lock().push((origin, height));
        if let Some((peer, from)) = self.cut_on_init.lock().take() {
            peer.withhold_headers_from(from);
        }
    }

    fn on_chain_insert(&self, results: &[crate::queue::FetchResult]) {
        self.inserted.lock().extend(results.iter().map(|result| result.number()));
    }

    fn on_body_fetch(&self, _headers: &[SealedHeader]) {
        self.body_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// A downloader on top of a [`TestChain`], with every peer response routed back into it.
struct DownloadTester {
    downloader: Downloader,
    chain: TestChain,
    observer: Arc<RecordingObserver>,
    responses: mpsc::UnboundedSender<WithPeerId<PeerResponse>>,
}

impl DownloadTester {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: DownloaderConfig) -> Self {
        Self::with_chain(TestChain::new(&TestBlocks::genesis()), config)
    }

    fn with_chain(chain: TestChain, config: DownloaderConfig) -> Self {
        aqua_tracing::init_test_tracing();
        let observer = Arc::new(RecordingObserver::default());
        let downloader = DownloaderBuilder::new(config)
            .observer(Arc::clone(&observer))
            .build(chain.clone(), chain.clone());

        let (responses, mut rx) = mpsc::unbounded_channel::<WithPeerId<PeerResponse>>();
        let router = downloader.clone();
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let (peer_id, response) = response.split();
                // responses racing the end of a cycle are refused
                let _ = match response {
                    PeerResponse::Headers(headers) => router.deliver_headers(&peer_id, headers),
                    PeerResponse::Bodies(bodies) => router.deliver_bodies(&peer_id, bodies),
                    PeerResponse::Receipts(receipts) => router.deliver_receipts(&peer_id, receipts),
                    PeerResponse::NodeData(nodes) => router.deliver_node_data(&peer_id, nodes),
                };
            }
        });

        Self { downloader, chain, observer, responses }
    }

    fn new_peer(&self, id: &str, blocks: &TestBlocks) -> Arc<TestSyncPeer> {
        let peer = Arc::new(TestSyncPeer::new(id, blocks.clone(), self.responses.clone()));
        self.downloader.register_peer(id.into(), 63, peer.clone()).unwrap();
        peer
    }

    async fn sync(&self, peer: &TestSyncPeer, mode: SyncMode) -> SyncResult<()> {
        let (head, td) = peer.head();
        self.downloader.synchronise(peer.id(), head, td, mode).await
    }

    /// Runs a sync in the background so the test can act while it is in progress.
    fn spawn_sync(
        &self,
        peer: &Arc<TestSyncPeer>,
        mode: SyncMode,
    ) -> tokio::task::JoinHandle<SyncResult<()>> {
        let downloader = self.downloader.clone();
        let sync_peer = Arc::clone(peer);
        tokio::spawn(async move {
            let (head, td) = sync_peer.head();
            downloader.synchronise(sync_peer.id(), head, td, mode).await
        })
    }

    /// Runs a sync against a peer that never answers, returning once its first request is out.
    async fn spawn_stalled_sync(
        &self,
        peer: &Arc<TestSyncPeer>,
    ) -> tokio::task::JoinHandle<SyncResult<()>> {
        peer.stall();
        let handle = self.spawn_sync(peer, SyncMode::Full);
        wait_until(|| peer.requests.headers.load(Ordering::SeqCst) > 0).await;
        handle
    }

    fn assert_head(&self, blocks: &TestBlocks) {
        let head = self.chain.current_block();
        assert_eq!(head.number, blocks.height());
        assert_eq!(head.hash(), blocks.head().hash());
    }
}

/// Splits the ancestor lookup traffic of a peer into spaced batches and single header lookups.
fn ancestor_requests(peer: &TestSyncPeer) -> (Vec<HeaderRequest>, Vec<HeaderRequest>) {
    let by_number = peer
        .header_requests()
        .into_iter()
        .filter(|request| matches!(request.origin, HeaderOrigin::Number(_)) && !request.reverse);
    let (spaced, single): (Vec<_>, Vec<_>) = by_number
        .filter(|request| request.skip == ANCESTOR_SPACING - 1 || request.amount == 1)
        .partition(|request| request.skip == ANCESTOR_SPACING - 1);
    (spaced, single)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_canonical_chain() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    assert_eq!(tester.chain.block_count(), 301);
    assert_eq!(tester.chain.receipt_count(), 0);
    assert_eq!(peer.requests.receipts.load(Ordering::SeqCst), 0);
    assert_eq!(peer.requests.node_data.load(Ordering::SeqCst), 0);
    assert_eq!(tester.observer.inserted.lock().len(), 300);
    assert_eq!(*tester.observer.inits.lock(), vec![(0, 300)]);
    assert!(!tester.downloader.synchronising());
    assert_eq!(
        tester.downloader.progress(),
        SyncProgress {
            starting_block: 0,
            current_block: 300,
            highest_block: 300,
            pulled_states: 0,
            known_states: 0,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_sync_commits_pivot_with_state() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Fast).await.unwrap();

    tester.assert_head(&blocks);
    assert_eq!(tester.chain.current_fast_block().number, 300);
    assert_eq!(tester.chain.current_header().number, 300);

    // blocks up to the pivot are stored with receipts but without state
    let pivot = blocks.header(284).unwrap();
    assert!(tester.chain.has_state(pivot.state_root));
    assert!(!tester.chain.has_state(blocks.header(283).unwrap().state_root));
    assert_eq!(tester.chain.receipt_count(), 284);
    assert!(peer.requests.node_data.load(Ordering::SeqCst) > 0);

    let progress = tester.downloader.progress();
    assert_eq!(progress.current_block, 300);
    assert_eq!(progress.highest_block, 300);
    assert_eq!(progress.pulled_states, TestBlocks::state_size());
    assert_eq!(progress.known_states, TestBlocks::state_size());
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_sync_short_chain_skips_state() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(10, 0);
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Fast).await.unwrap();

    tester.assert_head(&blocks);
    assert!(tester.chain.has_state(blocks.head().state_root));
    assert_eq!(peer.requests.node_data.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn content_is_spread_over_peers() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let peers = ["a", "b", "c"].map(|id| tester.new_peer(id, &blocks));

    tester.sync(&peers[0], SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    for peer in &peers {
        assert!(peer.requests.bodies.load(Ordering::SeqCst) > 0, "{} idle", peer.id());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_blocks_need_no_content_requests() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend_empty(200, 0);
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    assert_eq!(peer.requests.bodies.load(Ordering::SeqCst), 0);
    assert_eq!(tester.observer.body_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_up_to_date_chain() {
    let blocks = TestBlocks::genesis().extend(100, 0);
    let tester = DownloadTester::with_chain(TestChain::with_blocks(&blocks, 100), test_config());
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    assert_eq!(*tester.observer.inits.lock(), vec![(100, 100)]);
    assert_eq!(peer.requests.bodies.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_starts_at_previous_head() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let short = tester.new_peer("a", &blocks.clone().truncate(150));
    let long = tester.new_peer("b", &blocks);

    tester.sync(&short, SyncMode::Full).await.unwrap();
    let progress = tester.downloader.progress();
    assert_eq!(
        (progress.starting_block, progress.current_block, progress.highest_block),
        (0, 150, 150)
    );

    tester.downloader.unregister_peer(short.id());
    tester.sync(&long, SyncMode::Full).await.unwrap();
    tester.assert_head(&blocks);
    let progress = tester.downloader.progress();
    assert_eq!(
        (progress.starting_block, progress.current_block, progress.highest_block),
        (150, 300, 300)
    );
    assert_eq!(*tester.observer.inits.lock(), vec![(0, 150), (150, 300)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn forked_sync_switches_to_heavier_fork() {
    let tester = DownloadTester::new();
    let base = TestBlocks::genesis().extend(200, 0);
    let fork_a = base.clone().extend(100, 1);
    let fork_b = base.clone().extend(150, 2);
    let peer_a = tester.new_peer("a", &fork_a);
    let peer_b = tester.new_peer("b", &fork_b);

    tester.sync(&peer_a, SyncMode::Full).await.unwrap();
    tester.assert_head(&fork_a);

    tester.downloader.unregister_peer(peer_a.id());
    tester.sync(&peer_b, SyncMode::Full).await.unwrap();
    tester.assert_head(&fork_b);
    assert_eq!(tester.observer.inits.lock().last(), Some(&(200, 350)));
}

#[tokio::test(flavor = "multi_thread")]
async fn fork_below_ancestry_limit_is_refused() {
    let tester = DownloadTester::with_config(DownloaderConfig {
        max_fork_ancestry: 50,
        ..test_config()
    });
    let base = TestBlocks::genesis().extend(200, 0);
    let fork_a = base.clone().extend(100, 1);
    let fork_b = base.clone().extend(200, 2);
    let peer_a = tester.new_peer("a", &fork_a);
    let peer_b = tester.new_peer("b", &fork_b);

    tester.sync(&peer_a, SyncMode::Full).await.unwrap();
    let err = tester.sync(&peer_b, SyncMode::Full).await.unwrap_err();
    assert_matches!(err, SyncError::InvalidAncestor);
    assert!(err.should_drop_peer());
    tester.assert_head(&fork_a);
}

#[tokio::test(flavor = "multi_thread")]
async fn withheld_header_fails_cycle() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let attacker = tester.new_peer("attacker", &blocks);
    attacker.withhold_header(150);

    let err = tester.sync(&attacker, SyncMode::Full).await.unwrap_err();
    assert_matches!(err, SyncError::InvalidChain);
    assert!(tester.chain.current_block().number < 150);

    tester.downloader.unregister_peer(attacker.id());
    let honest = tester.new_peer("honest", &blocks);
    tester.sync(&honest, SyncMode::Full).await.unwrap();
    tester.assert_head(&blocks);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_header_rolls_back_and_disables_fast_sync() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    tester.chain.reject_header(blocks.hash(100).unwrap());
    let peer = tester.new_peer("a", &blocks);

    let err = tester.sync(&peer, SyncMode::Fast).await.unwrap_err();
    assert_matches!(err, SyncError::InvalidChain);
    assert!(tester.chain.current_header().number < 100);
    assert!(!tester.chain.has_header(blocks.hash(99).unwrap(), 99));

    // later fast cycles run as full ones
    tester.downloader.unregister_peer(peer.id());
    let other = TestBlocks::genesis().extend(300, 1);
    let peer = tester.new_peer("b", &other);
    tester.sync(&peer, SyncMode::Fast).await.unwrap();
    tester.assert_head(&other);
    assert_eq!(peer.requests.receipts.load(Ordering::SeqCst), 0);
    assert_eq!(peer.requests.node_data.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_withholding_advertised_chain_is_stalling() {
    let blocks = TestBlocks::genesis().extend(100, 0);
    let tester = DownloadTester::with_chain(TestChain::with_blocks(&blocks, 100), test_config());
    let peer = tester.new_peer("a", &blocks);

    let (head, td) = peer.head();
    let err = tester
        .downloader
        .synchronise(peer.id(), head, td + U256::from(1000), SyncMode::Full)
        .await
        .unwrap_err();
    assert_matches!(err, SyncError::StallingPeer);
    assert!(err.should_drop_peer());
}

#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_peer_times_out() {
    let tester = DownloadTester::new();
    let peer = tester.new_peer("a", &TestBlocks::genesis().extend(10, 0));
    peer.stall();

    let err = tester.sync(&peer, SyncMode::Full).await.unwrap_err();
    assert_matches!(err, SyncError::Timeout);
    assert!(!tester.downloader.synchronising());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_aborts_running_cycle() {
    let tester = DownloadTester::new();
    // no cycle to cancel
    tester.downloader.cancel();

    let peer = tester.new_peer("a", &TestBlocks::genesis().extend(10, 0));
    let sync = tester.spawn_stalled_sync(&peer).await;
    assert!(tester.downloader.synchronising());

    tester.downloader.cancel();
    let err = sync.await.unwrap().unwrap_err();
    assert!(err.is_cancellation());
    assert!(!tester.downloader.synchronising());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sync_is_busy() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(10, 0);
    let stalled = tester.new_peer("a", &blocks);
    let other = tester.new_peer("b", &blocks);
    let sync = tester.spawn_stalled_sync(&stalled).await;

    assert_matches!(tester.sync(&other, SyncMode::Full).await, Err(SyncError::Busy));
    assert_eq!(other.requests.headers.load(Ordering::SeqCst), 0);

    tester.downloader.cancel();
    assert!(sync.await.unwrap().unwrap_err().is_cancellation());
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistering_origin_cancels_cycle() {
    let tester = DownloadTester::new();
    let peer = tester.new_peer("a", &TestBlocks::genesis().extend(10, 0));
    let sync = tester.spawn_stalled_sync(&peer).await;

    tester.downloader.unregister_peer(peer.id());
    let err = sync.await.unwrap().unwrap_err();
    assert!(err.is_cancellation());
    assert!(!tester.downloader.peers().contains(peer.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_refuses_further_cycles() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(10, 0);
    let peer = tester.new_peer("a", &blocks);
    let sync = tester.spawn_stalled_sync(&peer).await;

    tester.downloader.terminate();
    assert!(sync.await.unwrap().unwrap_err().is_cancellation());

    let other = tester.new_peer("b", &blocks);
    assert_matches!(tester.sync(&other, SyncMode::Full).await, Err(SyncError::Terminated));
    assert_eq!(other.requests.headers.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn deliveries_outside_cycle_are_refused() {
    let tester = DownloadTester::new();
    let peer = tester.new_peer("a", &TestBlocks::genesis().extend(10, 0));

    assert_matches!(
        tester.downloader.deliver_headers(peer.id(), Vec::new()),
        Err(SyncError::NoSyncActive)
    );
    assert_matches!(
        tester.downloader.deliver_bodies(peer.id(), Vec::new()),
        Err(SyncError::NoSyncActive)
    );
    assert_matches!(
        tester.downloader.deliver_receipts(peer.id(), Vec::new()),
        Err(SyncError::NoSyncActive)
    );
    assert_matches!(
        tester.downloader.deliver_node_data(peer.id(), Vec::new()),
        Err(SyncError::NoSyncActive)
    );

    let sync = tester.spawn_stalled_sync(&peer).await;
    assert_matches!(
        tester.downloader.deliver_bodies(&"stranger".into(), Vec::new()),
        Err(SyncError::UnknownPeer)
    );
    tester.downloader.cancel();
    assert!(sync.await.unwrap().unwrap_err().is_cancellation());
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_with_unknown_peer() {
    let tester = DownloadTester::new();
    let err = tester
        .downloader
        .synchronise(&"stranger".into(), B256::ZERO, U256::ZERO, SyncMode::Full)
        .await
        .unwrap_err();
    assert_matches!(err, SyncError::UnknownPeer);
    assert!(!tester.downloader.synchronising());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_mode_never_syncs() {
    let tester = DownloadTester::new();
    let peer = tester.new_peer("a", &TestBlocks::genesis().extend(10, 0));

    tester.sync(&peer, SyncMode::Offline).await.unwrap();
    assert_eq!(peer.requests.headers.load(Ordering::SeqCst), 0);
    assert_eq!(tester.chain.current_block().number, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn register_refuses_duplicate_and_banned_peers() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis();
    let peer = tester.new_peer("a", &blocks);

    let duplicate = Arc::new(TestSyncPeer::new("a", blocks.clone(), tester.responses.clone()));
    assert_eq!(
        tester.downloader.register_peer("a".into(), 63, duplicate),
        Err(RegisterError::DuplicatePeer("a".into()))
    );

    tester.downloader.report_peer(peer.id(), ReputationChangeKind::BadProtocol);
    assert!(!tester.downloader.peers().contains(peer.id()));
    let again = Arc::new(TestSyncPeer::new("a", blocks, tester.responses.clone()));
    assert_eq!(
        tester.downloader.register_peer("a".into(), 63, again),
        Err(RegisterError::BannedPeer("a".into()))
    );
}

#[test]
fn register_passes_other_refusals_through() {
    assert_matches!(
        RegisterError::from(PeerSetError::NotRegistered("a".into())),
        RegisterError::PeerSet(PeerSetError::NotRegistered(_))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shifted_header_batches_are_refused() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let attacker = tester.new_peer("attacker", &blocks);
    // every fill of the first batch starts one block late
    attacker.withhold_header(1);

    let err = tester.sync(&attacker, SyncMode::Full).await.unwrap_err();
    assert_matches!(err, SyncError::InvalidChain);
    assert_eq!(tester.chain.current_block().number, 0);
    assert_eq!(tester.chain.header_count(), 1);

    tester.downloader.unregister_peer(attacker.id());
    let honest = tester.new_peer("honest", &blocks);
    tester.sync(&honest, SyncMode::Full).await.unwrap();
    tester.assert_head(&blocks);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsolicited_deliveries_do_not_stall_sync() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let peer = tester.new_peer("a", &blocks);
    let bystander = tester.new_peer("b", &blocks);
    peer.set_delay(Duration::from_millis(5));
    bystander.set_delay(Duration::from_millis(5));

    let sync = tester.spawn_sync(&peer, SyncMode::Full);
    wait_until(|| peer.requests.headers.load(Ordering::SeqCst) > 0).await;

    let stranger: PeerId = "stranger".into();
    let forged: Vec<Header> =
        blocks.headers()[1..33].iter().cloned().map(SealedHeader::unseal).collect();
    let mut refused = 0;
    for _ in 0..500 {
        let delivered = [
            tester.downloader.deliver_headers(&stranger, forged.clone()),
            tester.downloader.deliver_bodies(&stranger, vec![BlockBody::default(); 16]),
        ];
        for outcome in delivered {
            match outcome {
                Err(SyncError::UnknownPeer) => refused += 1,
                Err(SyncError::NoSyncActive) => {}
                other => panic!("unexpected delivery outcome {other:?}"),
            }
        }
        // registered peers get their data forwarded, the fetchers drop what nobody asked for
        let unsolicited = tester.downloader.deliver_headers(bystander.id(), forged.clone());
        assert_matches!(unsolicited, Ok(()) | Err(SyncError::NoSyncActive));
    }
    assert!(refused > 0);

    sync.await.unwrap().unwrap();
    tester.assert_head(&blocks);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_cycle_keeps_progress_origin() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let faulty = tester.new_peer("faulty", &blocks);
    faulty.withhold_header(150);

    assert_matches!(tester.sync(&faulty, SyncMode::Full).await, Err(SyncError::InvalidChain));
    let progress = tester.downloader.progress();
    assert_eq!((progress.starting_block, progress.highest_block), (0, 300));
    assert!(progress.current_block < 150);

    tester.downloader.unregister_peer(faulty.id());
    let valid = tester.new_peer("valid", &blocks);
    let sync = tester.spawn_sync(&valid, SyncMode::Full);
    while !sync.is_finished() {
        let progress = tester.downloader.progress();
        assert_eq!(progress.starting_block, 0);
        assert!(progress.current_block <= progress.highest_block);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    sync.await.unwrap().unwrap();

    tester.assert_head(&blocks);
    let progress = tester.downloader.progress();
    assert_eq!(
        (progress.starting_block, progress.current_block, progress.highest_block),
        (0, 300, 300)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_insertion_throttles_content_downloads() {
    let tester = DownloadTester::new();
    tester.chain.set_insert_delay(Duration::from_millis(3));
    let blocks = TestBlocks::genesis().extend(500, 0);
    let peer = tester.new_peer("a", &blocks);

    let sync = tester.spawn_sync(&peer, SyncMode::Full);
    let mut max_cached = 0;
    while !sync.is_finished() {
        max_cached = max_cached.max(tester.downloader.inner.queue.cached_results());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    sync.await.unwrap().unwrap();

    tester.assert_head(&blocks);
    assert!(max_cached > 0);
    assert!(max_cached <= test_config().block_cache_items, "cached {max_cached} results");
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_from_partial_chain() {
    let blocks = TestBlocks::genesis().extend(1524, 0);
    let tester = DownloadTester::with_chain(TestChain::with_blocks(&blocks, 500), test_config());
    let peer = tester.new_peer("a", &blocks);

    tester.sync(&peer, SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    assert_eq!(*tester.observer.inits.lock(), vec![(500, 1524)]);

    // the head request is followed by a single spaced lookup around the local head
    let requests = peer.header_requests();
    assert_eq!(requests[0].origin, HeaderOrigin::Hash(blocks.head().hash()));
    assert_eq!(requests[1].skip, ANCESTOR_SPACING - 1);
    let (spaced, single) = ancestor_requests(&peer);
    assert_eq!(spaced.len(), 1);
    assert!(single.is_empty());

    assert_eq!(*tester.observer.inserted.lock(), (501..=1524).collect::<Vec<BlockNumber>>());
    assert_eq!(
        tester.downloader.progress(),
        SyncProgress {
            starting_block: 500,
            current_block: 1524,
            highest_block: 1524,
            pulled_states: 0,
            known_states: 0,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fork_ancestor_is_found_by_bisection() {
    let base = TestBlocks::genesis().extend(200, 0);
    let fork_a = base.clone().extend(100, 1);
    let fork_b = base.clone().extend(150, 2);
    let tester = DownloadTester::with_chain(TestChain::with_blocks(&fork_a, 300), test_config());
    let peer = tester.new_peer("b", &fork_b);

    tester.sync(&peer, SyncMode::Full).await.unwrap();

    tester.assert_head(&fork_b);
    assert_eq!(*tester.observer.inits.lock(), vec![(200, 350)]);
    let (spaced, single) = ancestor_requests(&peer);
    assert_eq!(spaced.len(), 1);
    // a 300 block search space is split in at most nine steps
    assert!(!single.is_empty());
    assert!(single.len() <= 9, "{} single header lookups", single.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_response_is_reassigned() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    let origin = tester.new_peer("a", &blocks);
    let lossy = tester.new_peer("b", &blocks);
    lossy.drop_response(2);

    tester.sync(&origin, SyncMode::Full).await.unwrap();

    tester.assert_head(&blocks);
    let served = lossy.requests.headers.load(Ordering::SeqCst) +
        lossy.requests.bodies.load(Ordering::SeqCst);
    assert!(served >= 2, "lossy peer served {served} requests");
}

#[tokio::test(flavor = "multi_thread")]
async fn withheld_pivot_rolls_back_unverified_headers() {
    let config = test_config();
    let safety_net = config.fs_header_safety_net as u64;
    let tester = DownloadTester::with_config(config);
    let blocks = TestBlocks::genesis().extend(3 * safety_net as usize + 256 + 16, 0);
    let missing = 3 * safety_net + 32 + 1;
    let attacker = tester.new_peer("attacker", &blocks);
    // the attacker advertises the full chain but stops serving it once the cycle has started
    *tester.observer.cut_on_init.lock() = Some((Arc::clone(&attacker), missing));

    let err = tester.sync(&attacker, SyncMode::Fast).await.unwrap_err();
    assert_matches!(err, SyncError::StallingPeer);
    assert!(tester.chain.current_header().number <= missing - 1 - safety_net);
    assert_eq!(tester.chain.current_block().number, 0);

    // the next cycle imports everything as a full sync
    tester.downloader.unregister_peer(attacker.id());
    let valid = tester.new_peer("valid", &blocks);
    tester.sync(&valid, SyncMode::Fast).await.unwrap();
    tester.assert_head(&blocks);
    assert_eq!(tester.chain.header_count() as u64, blocks.height() + 1);
    assert_eq!(valid.requests.receipts.load(Ordering::SeqCst), 0);
    assert_eq!(valid.requests.node_data.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn content_failure_in_fast_sync_disables_it() {
    let tester = DownloadTester::new();
    let blocks = TestBlocks::genesis().extend(300, 0);
    tester.chain.fail_receipts_once(blocks.hash(100).unwrap());
    let peer = tester.new_peer("a", &blocks);

    let err = tester.sync(&peer, SyncMode::Fast).await.unwrap_err();
    assert_matches!(err, SyncError::InvalidChain);
    assert!(tester.chain.current_header().number < 300);
    assert_eq!(tester.chain.current_block().number, 0);

    tester.downloader.unregister_peer(peer.id());
    let other = tester.new_peer("b", &blocks);
    tester.sync(&other, SyncMode::Fast).await.unwrap();
    tester.assert_head(&blocks);
    assert_eq!(other.requests.receipts.load(Ordering::SeqCst), 0);
    assert_eq!(other.requests.node_data.load(Ordering::SeqCst), 0);
}
