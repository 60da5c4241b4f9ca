use crate::queue::FetchResult;
use aqua_primitives::{BlockNumber, SealedHeader};
use std::fmt::Debug;

/// Hooks invoked at fixed points of a sync cycle.
///
/// Every hook runs on the task that reached the point, so a slow hook slows that task down.
/// All hooks default to doing nothing.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SyncObserver: Debug + Send + Sync {
    /// The common ancestor and the remote height are known, right before fetching starts.
    fn on_sync_init(&self, _origin: BlockNumber, _height: BlockNumber) {}

    /// A batch of completed blocks is about to be inserted into the chain.
    fn on_chain_insert(&self, _results: &[FetchResult]) {}

    /// Bodies of the given headers are about to be requested.
    fn on_body_fetch(&self, _headers: &[SealedHeader]) {}

    /// Receipts of the given headers are about to be requested.
    fn on_receipt_fetch(&self, _headers: &[SealedHeader]) {}
}

/// A [`SyncObserver`] that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
