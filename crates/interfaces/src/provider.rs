use crate::consensus::ConsensusError;
use aqua_primitives::{BlockNumber, Bytes, Receipt, SealedBlock, SealedHeader, B256, U256};
use thiserror::Error;

/// Errors reported by chain storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The parent of an inserted item is not known.
    #[error("unknown parent {parent} of block {number}")]
    UnknownParent {
        /// Number of the orphaned block.
        number: BlockNumber,
        /// The missing parent hash.
        parent: B256,
    },
    /// The referenced block is not known.
    #[error("unknown block {0}")]
    UnknownBlock(B256),
    /// The state a block builds on is not available.
    #[error("missing state root {0}")]
    MissingState(B256),
    /// Header verification failed.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// A batch insertion that failed part way through.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("insertion failed at item {index}: {error}")]
pub struct InsertChainError {
    /// Number of items imported before the failure.
    pub index: usize,
    /// Why the item at `index` was refused.
    #[source]
    pub error: ProviderError,
}

impl InsertChainError {
    /// Creates a new error for the item at `index`.
    pub fn new(index: usize, error: impl Into<ProviderError>) -> Self {
        Self { index, error: error.into() }
    }
}

/// Read and write access to the local chain.
///
/// Implementations serialize their own writes; the downloader issues inserts from a single task.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait BlockChain: Send + Sync {
    /// Whether the header is stored locally.
    fn has_header(&self, hash: B256, number: BlockNumber) -> bool;

    /// Whether the full block and the state it produces are stored locally.
    fn has_block(&self, hash: B256, number: BlockNumber) -> bool;

    /// Looks up a header by hash.
    fn header_by_hash(&self, hash: B256) -> Option<SealedHeader>;

    /// Looks up a block by hash.
    fn block_by_hash(&self, hash: B256) -> Option<SealedBlock>;

    /// Head of the local header chain.
    fn current_header(&self) -> SealedHeader;

    /// Header of the highest block whose state is available.
    fn current_block(&self) -> SealedHeader;

    /// Header of the highest block whose body and receipts are available.
    fn current_fast_block(&self) -> SealedHeader;

    /// Total difficulty of the given block, if known.
    fn total_difficulty(&self, hash: B256, number: BlockNumber) -> Option<U256>;

    /// Inserts a contiguous batch of headers, verifying every `check_freq`-th seal.
    ///
    /// Returns the number of headers imported.
    fn insert_header_chain(
        &self,
        headers: &[SealedHeader],
        check_freq: usize,
    ) -> Result<usize, InsertChainError>;

    /// Imports full blocks, executing them on top of their parent state.
    fn insert_chain(&self, blocks: Vec<SealedBlock>) -> Result<usize, InsertChainError>;

    /// Stores blocks together with their receipts without executing them.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<SealedBlock>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, InsertChainError>;

    /// Removes the given headers and everything derived from them, rewinding head pointers.
    fn rollback(&self, hashes: &[B256]);

    /// Marks a block imported through receipts as the head of the full chain.
    ///
    /// Fails if the block's state was not downloaded.
    fn fast_sync_commit_head(&self, hash: B256) -> Result<(), ProviderError>;
}

/// Access to the local state trie database for state synchronisation.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait StateProvider: Send + Sync {
    /// Returns a scheduler that walks the trie rooted at `root` and yields missing nodes.
    fn state_sync(&self, root: B256) -> Box<dyn NodeScheduler>;
}

/// Walks a state trie and tracks which nodes still have to be retrieved.
pub trait NodeScheduler: Send {
    /// Returns up to `max` hashes of nodes that are known to be missing.
    ///
    /// Hashes handed out before may be returned again until they are processed.
    fn missing(&self, max: usize) -> Vec<B256>;

    /// Feeds a retrieved node, expanding its children.
    fn process(&mut self, hash: B256, data: Bytes) -> Result<(), NodeSyncError>;

    /// Number of nodes still missing.
    fn pending(&self) -> usize;

    /// Flushes processed nodes to the database and returns how many were written.
    fn commit(&mut self) -> Result<usize, ProviderError>;
}

/// Errors raised while processing retrieved state nodes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeSyncError {
    /// The node was never scheduled.
    #[error("node {0} was not requested")]
    NotRequested(B256),
    /// The node was already processed.
    #[error("node {0} already processed")]
    AlreadyProcessed(B256),
    /// The node could not be decoded.
    #[error("invalid node {0}")]
    InvalidNode(B256),
}
