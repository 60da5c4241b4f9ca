//! Common ancestor search against the origin peer.

use crate::{
    downloader::{headers::wait_for_headers, HeaderDeliveries},
    peers::PeerConnection,
};
use aqua_interfaces::{
    p2p::{SyncError, SyncResult},
    provider::BlockChain,
    sync::SyncMode,
};
use aqua_primitives::{BlockNumber, SealedHeader};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Spacing of the headers of the initial ancestor request.
pub(crate) const ANCESTOR_SPACING: u64 = 16;

/// Locates the highest block the local chain shares with a remote peer.
///
/// The search first asks for a sparse batch of headers right below the local head, which finds
/// the ancestor in a single round trip when both sides follow the same chain. Otherwise it falls
/// back to a binary search over single headers that never reaches deeper than `max_fork_ancestry`
/// blocks below the local head.
pub(crate) struct AncestorLocator<'a> {
    pub(crate) chain: &'a dyn BlockChain,
    pub(crate) peer: &'a PeerConnection,
    pub(crate) deliveries: &'a mut HeaderDeliveries,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) max_header_fetch: u64,
    pub(crate) max_fork_ancestry: u64,
    pub(crate) ttl: Duration,
}

// === impl AncestorLocator ===

impl AncestorLocator<'_> {
    /// Runs the search for a peer whose chain ends at `remote_height`.
    pub(crate) async fn find(
        mut self,
        remote_height: BlockNumber,
        mode: SyncMode,
    ) -> SyncResult<BlockNumber> {
        let local_head = match mode {
            SyncMode::Fast => self.chain.current_fast_block().number,
            _ => self.chain.current_block().number,
        };
        let floor = local_head.checked_sub(self.max_fork_ancestry);
        debug!(
            target: "downloaders::sync",
            peer_id = %self.peer.id(),
            local_head,
            remote_height,
            ?floor,
            "Looking for common ancestor"
        );

        let head = local_head.min(remote_height);
        let from = head.saturating_sub(self.max_header_fetch);
        // span past the head to catch peers lying about their height
        let limit = (2 * self.max_header_fetch / ANCESTOR_SPACING).max(1);
        let count = (1 + (local_head - from) / ANCESTOR_SPACING).min(limit);

        self.peer.client().request_headers_by_number(from, count, ANCESTOR_SPACING - 1, false)?;
        let headers = self.wait().await?;
        if headers.is_empty() {
            warn!(target: "downloaders::sync", peer_id = %self.peer.id(), "Empty head header set");
            return Err(SyncError::EmptyHeaderSet)
        }
        for (index, header) in headers.iter().enumerate() {
            let expected = from + index as u64 * ANCESTOR_SPACING;
            if header.number != expected {
                warn!(target: "downloaders::sync", peer_id = %self.peer.id(), index, number = header.number, expected, "Head headers broke chain ordering");
                return Err(SyncError::InvalidChain)
            }
        }

        let found = headers
            .iter()
            .rev()
            .filter(|header| header.number >= from && header.number <= local_head)
            .find(|header| self.is_known(mode, header));
        if let Some(header) = found {
            let number = header.number;
            if floor.is_some_and(|floor| number <= floor) {
                warn!(target: "downloaders::sync", peer_id = %self.peer.id(), number, hash = %header.hash(), ?floor, "Ancestor below allowance");
                return Err(SyncError::InvalidAncestor)
            }
            debug!(target: "downloaders::sync", peer_id = %self.peer.id(), number, hash = %header.hash(), "Found common ancestor");
            return Ok(number)
        }

        let mut start = floor.unwrap_or(0);
        let mut end = head;
        while start + 1 < end {
            let check = (start + end) / 2;
            self.peer.client().request_headers_by_number(check, 1, 0, false)?;
            let headers = self.wait().await?;
            let [header] = headers.as_slice() else {
                debug!(target: "downloaders::sync", peer_id = %self.peer.id(), count = headers.len(), "Multiple headers for single request");
                return Err(SyncError::BadPeer)
            };
            if header.number != check {
                debug!(target: "downloaders::sync", peer_id = %self.peer.id(), number = header.number, check, "Received non requested header");
                return Err(SyncError::BadPeer)
            }
            trace!(target: "downloaders::sync", check, known = self.is_known(mode, header), "Probed ancestor candidate");
            if self.is_known(mode, header) {
                start = check;
            } else {
                end = check;
            }
        }

        if floor.is_some_and(|floor| start <= floor) {
            warn!(target: "downloaders::sync", peer_id = %self.peer.id(), number = start, ?floor, "Ancestor below allowance");
            return Err(SyncError::InvalidAncestor)
        }
        debug!(target: "downloaders::sync", peer_id = %self.peer.id(), number = start, "Found common ancestor");
        Ok(start)
    }

    /// Full sync needs the block including its state, fast sync only the header.
    fn is_known(&self, mode: SyncMode, header: &SealedHeader) -> bool {
        match mode {
            SyncMode::Fast => self.chain.has_header(header.hash(), header.number),
            _ => self.chain.has_block(header.hash(), header.number),
        }
    }

    async fn wait(&mut self) -> SyncResult<Vec<SealedHeader>> {
        wait_for_headers(self.peer, self.deliveries, self.cancel, self.ttl).await
    }
}
