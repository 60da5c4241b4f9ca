use crate::p2p::error::RequestResult;
use aqua_primitives::{BlockNumber, B256, U256};
use std::fmt::Debug;

/// Optional protocol messages a remote peer can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCapabilities {
    /// Whether the peer answers receipt requests.
    pub supports_receipts: bool,
    /// Whether the peer answers state node requests.
    pub supports_node_data: bool,
}

impl PeerCapabilities {
    /// First protocol version that serves receipts and state nodes.
    pub const FAST_SYNC_VERSION: u32 = 63;

    /// Capabilities of a peer that serves everything.
    pub const fn full() -> Self {
        Self { supports_receipts: true, supports_node_data: true }
    }

    /// Derives the capabilities negotiated for a protocol version.
    pub const fn from_version(version: u32) -> Self {
        let fast = version >= Self::FAST_SYNC_VERSION;
        Self { supports_receipts: fast, supports_node_data: fast }
    }
}

/// Requests the downloader issues to a remote peer.
///
/// Every request is fire-and-forget: it returns once the message was handed to the session and
/// the response is routed back through the downloader's `deliver_*` entry points.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SyncPeer: Debug + Send + Sync {
    /// The head the peer advertised during the handshake or its latest announcement, with the
    /// total difficulty of that head.
    fn head(&self) -> (B256, U256);

    /// Requests `amount` headers starting at the header with hash `origin`, leaving `skip` headers
    /// between consecutive ones, walking towards genesis if `reverse` is set.
    fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> RequestResult<()>;

    /// Same as [`SyncPeer::request_headers_by_hash`] but starting at a block number.
    fn request_headers_by_number(
        &self,
        origin: BlockNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> RequestResult<()>;

    /// Requests the bodies of the given blocks.
    fn request_bodies(&self, hashes: Vec<B256>) -> RequestResult<()>;

    /// Requests the receipts of the given blocks.
    fn request_receipts(&self, hashes: Vec<B256>) -> RequestResult<()>;

    /// Requests state trie nodes by hash.
    fn request_node_data(&self, hashes: Vec<B256>) -> RequestResult<()>;
}
