//! Retrieval of the state trie at the fast sync pivot.

use crate::{
    downloader::{DownloaderInner, NodeDataDeliveries},
    fetch::FETCH_TICK,
    peers::ContentKind,
    reputation::ReputationChangeKind,
};
use aqua_interfaces::{
    p2p::{SyncError, SyncResult},
    provider::{NodeScheduler, NodeSyncError},
};
use aqua_primitives::{keccak256, Bytes, PeerId, SealedHeader, WithPeerId, B256};
use std::{
    collections::{HashMap, HashSet},
    panic,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Node hashes handed to one peer.
#[derive(Debug)]
struct StateRequest {
    hashes: HashSet<B256>,
    issued: Instant,
}

/// Handle to a running state retrieval.
///
/// Dropping the handle cancels the retrieval.
#[derive(Debug)]
pub(crate) struct StateSync {
    pivot: SealedHeader,
    cancel: CancellationToken,
    task: JoinHandle<SyncResult<()>>,
    result: Option<SyncResult<()>>,
}

// === impl StateSync ===

impl StateSync {
    /// The block whose state is retrieved.
    pub(crate) fn pivot(&self) -> &SealedHeader {
        &self.pivot
    }

    /// Whether the retrieval finished, successfully or not.
    pub(crate) fn is_finished(&self) -> bool {
        self.result.is_some() || self.task.is_finished()
    }

    /// Waits for the retrieval to finish.
    pub(crate) async fn wait(&mut self) -> SyncResult<()> {
        if let Some(result) = &self.result {
            return result.clone()
        }
        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SyncError::CancelStateFetch),
        };
        self.result = Some(result.clone());
        result
    }

    /// Stops the retrieval and waits for it to wind down.
    pub(crate) async fn cancel(mut self) -> SyncResult<()> {
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for StateSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// === impl DownloaderInner ===

impl DownloaderInner {
    /// Starts retrieving the state of `pivot` in the background.
    pub(crate) fn spawn_state_sync(
        self: &Arc<Self>,
        pivot: SealedHeader,
        deliveries: NodeDataDeliveries,
        cancel: &CancellationToken,
    ) -> StateSync {
        let cancel = cancel.child_token();
        let task = tokio::spawn(Arc::clone(self).run_state_sync(
            pivot.state_root,
            deliveries,
            cancel.clone(),
        ));
        StateSync { pivot, cancel, task, result: None }
    }

    async fn run_state_sync(
        self: Arc<Self>,
        root: B256,
        deliveries: NodeDataDeliveries,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        // a previous retrieval of this cycle may still hold the receiver while winding down
        let mut deliveries = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::CancelStateFetch),
            guard = deliveries.lock() => guard,
        };
        debug!(target: "downloaders::state", %root, "State sync starting");

        let mut scheduler = self.state.state_sync(root);
        let mut requests = HashMap::new();
        let result =
            self.drive_state_sync(scheduler.as_mut(), &mut deliveries, &mut requests, &cancel).await;

        for peer_id in requests.keys() {
            if let Some(peer) = self.peers.peer(peer_id) {
                peer.set_idle(ContentKind::NodeData, 0);
            }
        }
        match &result {
            Ok(()) => debug!(target: "downloaders::state", %root, "State sync completed"),
            Err(err) => debug!(target: "downloaders::state", %root, %err, "State sync aborted"),
        }
        result
    }

    async fn drive_state_sync(
        &self,
        scheduler: &mut dyn NodeScheduler,
        deliveries: &mut tokio::sync::mpsc::UnboundedReceiver<WithPeerId<Vec<Bytes>>>,
        requests: &mut HashMap<PeerId, StateRequest>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mut ticker = interval(FETCH_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pending = scheduler.pending();
            let pulled = self.pulled_states.load(Ordering::Relaxed);
            self.known_states.store(pulled + pending as u64, Ordering::Relaxed);
            if pending == 0 {
                let written = scheduler.commit()?;
                trace!(target: "downloaders::state", written, "Committed state nodes");
                return Ok(())
            }
            self.assign_state_tasks(&*scheduler, requests)?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::CancelStateFetch),
                packet = deliveries.recv() => {
                    let Some(packet) = packet else { return Err(SyncError::CancelStateFetch) };
                    self.process_node_data(scheduler, requests, packet);
                }
                _ = ticker.tick() => self.expire_state_requests(requests),
            }
        }
    }

    /// Hands missing nodes to idle peers, skipping nodes already requested and nodes a peer
    /// failed to deliver before.
    fn assign_state_tasks(
        &self,
        scheduler: &dyn NodeScheduler,
        requests: &mut HashMap<PeerId, StateRequest>,
    ) -> SyncResult<()> {
        if self.peers.is_empty() {
            return Err(SyncError::NoPeers)
        }
        let metrics = self.fetch_metrics.get(ContentKind::NodeData);
        let (idle, total) = self.peers.idle_peers(ContentKind::NodeData);
        let rtt = self.peers.request_rtt();
        let capacities =
            idle.iter().map(|peer| peer.capacity(ContentKind::NodeData, rtt)).collect::<Vec<_>>();

        let in_flight =
            requests.values().flat_map(|request| request.hashes.iter().copied()).collect::<HashSet<_>>();
        let mut candidates = scheduler
            .missing(in_flight.len() + capacities.iter().sum::<usize>())
            .into_iter()
            .filter(|hash| !in_flight.contains(hash))
            .collect::<Vec<_>>();
        metrics.pending_tasks.set(scheduler.pending() as f64);

        for (peer, capacity) in idle.iter().zip(capacities) {
            if candidates.is_empty() {
                break
            }
            let (mut hashes, mut rest): (Vec<B256>, Vec<B256>) =
                std::mem::take(&mut candidates).into_iter().partition(|hash| !peer.lacks(hash));
            if hashes.len() > capacity {
                rest.extend(hashes.drain(capacity..));
            }
            candidates = rest;
            if hashes.is_empty() {
                continue
            }
            trace!(target: "downloaders::state", peer_id = %peer.id(), count = hashes.len(), "Requesting state nodes");
            metrics.requests.increment(1);
            if let Err(err) = peer.fetch_node_data(hashes.clone()) {
                debug!(target: "downloaders::state", peer_id = %peer.id(), %err, "Failed to send state request");
                candidates.extend(hashes);
                continue
            }
            requests.insert(
                peer.id().clone(),
                StateRequest { hashes: hashes.into_iter().collect(), issued: Instant::now() },
            );
        }

        if requests.is_empty() && idle.len() == total {
            debug!(target: "downloaders::state", peers = total, "No peer can serve the missing state");
            return Err(SyncError::PeersUnavailable)
        }
        Ok(())
    }

    fn process_node_data(
        &self,
        scheduler: &mut dyn NodeScheduler,
        requests: &mut HashMap<PeerId, StateRequest>,
        packet: WithPeerId<Vec<Bytes>>,
    ) {
        let (peer_id, nodes) = packet.split();
        let Some(mut request) = requests.remove(&peer_id) else {
            trace!(target: "downloaders::state", %peer_id, "Unrequested state nodes");
            return
        };

        let mut delivered = 0;
        let mut invalid = false;
        for node in nodes {
            let hash = keccak256(&node);
            if !request.hashes.remove(&hash) {
                continue
            }
            match scheduler.process(hash, node) {
                Ok(()) => delivered += 1,
                Err(NodeSyncError::NotRequested(_) | NodeSyncError::AlreadyProcessed(_)) => {}
                Err(err) => {
                    debug!(target: "downloaders::state", %peer_id, %err, "Invalid state node");
                    invalid = true;
                }
            }
        }
        self.pulled_states.fetch_add(delivered as u64, Ordering::Relaxed);
        self.metrics.pulled_states.increment(delivered as u64);
        self.fetch_metrics.get(ContentKind::NodeData).delivered.increment(delivered as u64);

        let Some(peer) = self.peers.peer(&peer_id) else { return };
        for hash in request.hashes {
            peer.mark_lacking(hash);
        }
        peer.set_idle(ContentKind::NodeData, delivered);
        if invalid {
            self.penalize(&peer_id, ReputationChangeKind::BadMessage);
        }
    }

    fn expire_state_requests(&self, requests: &mut HashMap<PeerId, StateRequest>) {
        let ttl = self.peers.request_ttl();
        let expired = requests
            .iter()
            .filter(|(_, request)| request.issued.elapsed() > ttl)
            .map(|(peer_id, _)| peer_id.clone())
            .collect::<Vec<_>>();
        for peer_id in expired {
            let Some(request) = requests.remove(&peer_id) else { continue };
            self.fetch_metrics.get(ContentKind::NodeData).timeouts.increment(1);
            let Some(peer) = self.peers.peer(&peer_id) else { continue };
            if request.hashes.len() > 2 {
                trace!(target: "downloaders::state", %peer_id, fails = request.hashes.len(), "State delivery timed out");
                peer.set_idle(ContentKind::NodeData, 0);
            } else {
                debug!(target: "downloaders::state", %peer_id, "Stalling state delivery, dropping");
                self.drop_peer(&peer_id, ReputationChangeKind::Timeout);
            }
        }
    }
}
