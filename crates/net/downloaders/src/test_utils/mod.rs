//! Test helpers: a deterministic block generator, an in memory chain and scripted peers.

mod blocks;
mod chain;
mod peer;

pub use blocks::TestBlocks;
pub use chain::TestChain;
pub use peer::{
    HeaderOrigin, HeaderRequest, NoopSyncPeer, PeerResponse, RequestCounts, TestSyncPeer,
};
