use super::blocks::{TestBlocks, BRANCH_NODE, LEAF_NODE};
use aqua_interfaces::{
    consensus::{Consensus, ConsensusError},
    provider::{
        BlockChain, InsertChainError, NodeScheduler, NodeSyncError, ProviderError, StateProvider,
    },
    test_utils::TestConsensus,
};
use aqua_primitives::{BlockNumber, Bytes, Receipt, SealedBlock, SealedHeader, B256, U256};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

#[derive(Debug, Default)]
struct ChainData {
    headers: HashMap<B256, SealedHeader>,
    td: HashMap<B256, U256>,
    blocks: HashMap<B256, SealedBlock>,
    receipts: HashMap<B256, Vec<Receipt>>,
    /// State trie nodes.
    nodes: HashMap<B256, Bytes>,
    /// Roots of the complete state tries.
    states: HashSet<B256>,
    header_head: B256,
    fast_head: B256,
    block_head: B256,
    /// Headers refused on insertion, as if their seal was invalid.
    invalid: HashSet<B256>,
    /// Blocks whose next receipt chain insertion fails.
    failing_receipts: HashSet<B256>,
    /// Time every block or receipt chain insertion takes.
    insert_delay: Duration,
}

impl ChainData {
    fn td_of(&self, hash: &B256) -> U256 {
        self.td.get(hash).copied().unwrap_or_default()
    }

    fn insert_header(&mut self, header: &SealedHeader) {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return
        }
        let td = self.td_of(&header.parent_hash) + header.difficulty;
        self.headers.insert(hash, header.clone());
        self.td.insert(hash, td);
        if td > self.td_of(&self.header_head) {
            self.header_head = hash;
        }
    }

    fn has_state(&self, hash: &B256) -> bool {
        self.blocks.get(hash).is_some_and(|block| self.states.contains(&block.state_root))
    }
}

/// An in memory chain and state database.
///
/// Inserted blocks are "executed" by marking their state root as available, receipts are stored
/// without state. State retrieved through [`StateProvider::state_sync`] lands in the same database.
/// Headers are verified by a [`TestConsensus`] on insertion.
#[derive(Debug, Clone)]
pub struct TestChain {
    data: Arc<RwLock<ChainData>>,
    consensus: Arc<TestConsensus>,
}

impl TestChain {
    /// A chain holding the genesis block of `blocks`, with its state.
    pub fn new(blocks: &TestBlocks) -> Self {
        let genesis = blocks.genesis_block();
        let hash = genesis.hash();
        let mut data = ChainData {
            header_head: hash,
            fast_head: hash,
            block_head: hash,
            ..Default::default()
        };
        data.headers.insert(hash, genesis.header.clone());
        data.td.insert(hash, genesis.difficulty);
        data.states.insert(genesis.state_root);
        data.blocks.insert(hash, genesis);
        Self { data: Arc::new(RwLock::new(data)), consensus: Default::default() }
    }

    /// A chain holding the first `count` blocks of `blocks`, fully executed.
    pub fn with_blocks(blocks: &TestBlocks, count: usize) -> Self {
        let chain = Self::new(blocks);
        chain
            .insert_chain(blocks.blocks().into_iter().take(count).collect())
            .expect("test blocks import");
        chain
    }

    /// The consensus engine verifying inserted headers.
    pub fn consensus(&self) -> &TestConsensus {
        &self.consensus
    }

    /// Refuses the header on insertion.
    pub fn reject_header(&self, hash: B256) {
        self.data.write().invalid.insert(hash);
    }

    /// Fails the next receipt chain insertion that includes the block.
    pub fn fail_receipts_once(&self, hash: B256) {
        self.data.write().failing_receipts.insert(hash);
    }

    /// Makes every block and receipt chain insertion take `delay`.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.data.write().insert_delay = delay;
    }

    /// Blocks the calling thread for the configured insertion time.
    fn simulate_insert_time(&self) {
        let delay = self.data.read().insert_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Number of headers stored.
    pub fn header_count(&self) -> usize {
        self.data.read().headers.len()
    }

    /// Number of blocks stored, executed or not.
    pub fn block_count(&self) -> usize {
        self.data.read().blocks.len()
    }

    /// Number of receipt lists stored.
    pub fn receipt_count(&self) -> usize {
        self.data.read().receipts.len()
    }

    /// Whether the state trie rooted at `root` is stored.
    pub fn has_state(&self, root: B256) -> bool {
        self.data.read().states.contains(&root)
    }
}

impl BlockChain for TestChain {
    fn has_header(&self, hash: B256, number: BlockNumber) -> bool {
        self.data.read().headers.get(&hash).is_some_and(|header| header.number == number)
    }

    fn has_block(&self, hash: B256, number: BlockNumber) -> bool {
        let data = self.data.read();
        data.blocks.get(&hash).is_some_and(|block| block.number == number) && data.has_state(&hash)
    }

    fn header_by_hash(&self, hash: B256) -> Option<SealedHeader> {
        self.data.read().headers.get(&hash).cloned()
    }

    fn block_by_hash(&self, hash: B256) -> Option<SealedBlock> {
        self.data.read().blocks.get(&hash).cloned()
    }

    fn current_header(&self) -> SealedHeader {
        let data = self.data.read();
        data.headers[&data.header_head].clone()
    }

    fn current_block(&self) -> SealedHeader {
        let data = self.data.read();
        data.headers[&data.block_head].clone()
    }

    fn current_fast_block(&self) -> SealedHeader {
        let data = self.data.read();
        data.headers[&data.fast_head].clone()
    }

    fn total_difficulty(&self, hash: B256, _number: BlockNumber) -> Option<U256> {
        self.data.read().td.get(&hash).copied()
    }

    fn insert_header_chain(
        &self,
        headers: &[SealedHeader],
        _check_freq: usize,
    ) -> Result<usize, InsertChainError> {
        let mut data = self.data.write();
        for (index, header) in headers.iter().enumerate() {
            let Some(parent) = data.headers.get(&header.parent_hash) else {
                return Err(InsertChainError::new(
                    index,
                    ProviderError::UnknownParent { number: header.number, parent: header.parent_hash },
                ))
            };
            self.consensus
                .validate_header(header, parent)
                .map_err(|err| InsertChainError::new(index, err))?;
            if data.invalid.contains(&header.hash()) {
                return Err(InsertChainError::new(
                    index,
                    ConsensusError::InvalidSeal { hash: header.hash() },
                ))
            }
            data.insert_header(header);
        }
        Ok(headers.len())
    }

    fn insert_chain(&self, blocks: Vec<SealedBlock>) -> Result<usize, InsertChainError> {
        self.simulate_insert_time();
        let mut data = self.data.write();
        let count = blocks.len();
        for (index, block) in blocks.into_iter().enumerate() {
            if !data.has_state(&block.parent_hash) {
                return Err(InsertChainError::new(
                    index,
                    ProviderError::UnknownParent { number: block.number, parent: block.parent_hash },
                ))
            }
            if data.invalid.contains(&block.hash()) {
                return Err(InsertChainError::new(
                    index,
                    ConsensusError::InvalidSeal { hash: block.hash() },
                ))
            }
            data.insert_header(&block.header);
            let hash = block.hash();
            let td = data.td_of(&hash);
            data.states.insert(block.state_root);
            data.blocks.insert(hash, block);
            if td > data.td_of(&data.block_head) {
                data.block_head = hash;
            }
            if td > data.td_of(&data.fast_head) {
                data.fast_head = hash;
            }
        }
        Ok(count)
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<SealedBlock>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, InsertChainError> {
        self.simulate_insert_time();
        let mut data = self.data.write();
        let count = blocks.len();
        for (index, (block, receipts)) in blocks.into_iter().zip(receipts).enumerate() {
            let hash = block.hash();
            if !data.headers.contains_key(&hash) {
                return Err(InsertChainError::new(index, ProviderError::UnknownBlock(hash)))
            }
            if data.failing_receipts.remove(&hash) {
                return Err(InsertChainError::new(index, ConsensusError::InvalidSeal { hash }))
            }
            let td = data.td_of(&hash);
            data.blocks.insert(hash, block);
            data.receipts.insert(hash, receipts);
            if td > data.td_of(&data.fast_head) {
                data.fast_head = hash;
            }
        }
        Ok(count)
    }

    fn rollback(&self, hashes: &[B256]) {
        let mut guard = self.data.write();
        let data = &mut *guard;
        for hash in hashes.iter().rev() {
            let Some(header) = data.headers.remove(hash) else { continue };
            data.td.remove(hash);
            data.blocks.remove(hash);
            data.receipts.remove(hash);
            for head in [&mut data.header_head, &mut data.fast_head, &mut data.block_head] {
                if *head == *hash {
                    *head = header.parent_hash;
                }
            }
        }
    }

    fn fast_sync_commit_head(&self, hash: B256) -> Result<(), ProviderError> {
        let mut data = self.data.write();
        let Some(block) = data.blocks.get(&hash) else {
            return Err(ProviderError::UnknownBlock(hash))
        };
        if !data.states.contains(&block.state_root) {
            return Err(ProviderError::MissingState(block.state_root))
        }
        data.block_head = hash;
        Ok(())
    }
}

impl StateProvider for TestChain {
    fn state_sync(&self, root: B256) -> Box<dyn NodeScheduler> {
        let mut missing = BTreeSet::new();
        if !self.data.read().nodes.contains_key(&root) {
            missing.insert(root);
        }
        Box::new(TestNodeScheduler {
            data: Arc::clone(&self.data),
            root,
            missing,
            processed: HashMap::new(),
        })
    }
}

/// Retrieves the trie of a [`TestBlocks`] state: branch nodes list the hashes of their children.
#[derive(Debug)]
struct TestNodeScheduler {
    data: Arc<RwLock<ChainData>>,
    root: B256,
    missing: BTreeSet<B256>,
    processed: HashMap<B256, Bytes>,
}

impl NodeScheduler for TestNodeScheduler {
    fn missing(&self, max: usize) -> Vec<B256> {
        self.missing.iter().take(max).copied().collect()
    }

    fn process(&mut self, hash: B256, data: Bytes) -> Result<(), NodeSyncError> {
        if !self.missing.contains(&hash) {
            if self.processed.contains_key(&hash) {
                return Err(NodeSyncError::AlreadyProcessed(hash))
            }
            return Err(NodeSyncError::NotRequested(hash))
        }
        match data.first() {
            Some(&BRANCH_NODE) if (data.len() - 1) % 32 == 0 => {
                let stored = self.data.read();
                for child in data[1..].chunks(32).map(B256::from_slice) {
                    if !stored.nodes.contains_key(&child) && !self.processed.contains_key(&child) {
                        self.missing.insert(child);
                    }
                }
            }
            Some(&LEAF_NODE) => {}
            _ => return Err(NodeSyncError::InvalidNode(hash)),
        }
        self.missing.remove(&hash);
        self.processed.insert(hash, data);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.missing.len()
    }

    fn commit(&mut self) -> Result<usize, ProviderError> {
        let mut data = self.data.write();
        let written = self.processed.len();
        data.nodes.extend(self.processed.drain());
        if self.missing.is_empty() && data.nodes.contains_key(&self.root) {
            data.states.insert(self.root);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn header_chain_rollback_rewinds_head() {
        let blocks = TestBlocks::genesis().extend(10, 0);
        let chain = TestChain::new(&blocks);
        let headers = blocks.headers();

        assert_eq!(chain.insert_header_chain(&headers[1..], 1), Ok(10));
        assert_eq!(chain.current_header().number, 10);
        assert_eq!(chain.current_block().number, 0);

        let hashes = headers[6..].iter().map(SealedHeader::hash).collect::<Vec<_>>();
        chain.rollback(&hashes);
        assert_eq!(chain.current_header().number, 5);
        assert!(!chain.has_header(headers[6].hash(), 6));
    }

    #[test]
    fn rejects_orphans_and_invalid_headers() {
        let blocks = TestBlocks::genesis().extend(10, 0);
        let chain = TestChain::new(&blocks);
        let headers = blocks.headers();

        let err = chain.insert_header_chain(&headers[2..], 1).unwrap_err();
        assert_eq!(err.index, 0);
        assert_matches!(err.error, ProviderError::UnknownParent { number: 2, .. });

        chain.reject_header(headers[4].hash());
        let err = chain.insert_header_chain(&headers[1..], 1).unwrap_err();
        assert_eq!(err.index, 3);
        assert_eq!(chain.current_header().number, 3);
    }

    #[test]
    fn failing_consensus_refuses_headers() {
        let blocks = TestBlocks::genesis().extend(3, 0);
        let chain = TestChain::new(&blocks);
        chain.consensus().set_fail_validation(true);

        let err = chain.insert_header_chain(&blocks.headers()[1..], 1).unwrap_err();
        assert_eq!(err.index, 0);
        assert_matches!(err.error, ProviderError::Consensus(ConsensusError::InvalidSeal { .. }));
        assert_eq!(chain.header_count(), 1);

        chain.consensus().set_fail_validation(false);
        assert_eq!(chain.insert_header_chain(&blocks.headers()[1..], 1), Ok(3));
    }

    #[test]
    fn receipt_insertion_fails_once() {
        let blocks = TestBlocks::genesis().extend(6, 0);
        let chain = TestChain::new(&blocks);
        chain.insert_header_chain(&blocks.headers()[1..], 1).unwrap();
        let fast = blocks.blocks();
        let receipts =
            fast.iter().map(|block| blocks.receipts(block.hash()).unwrap()).collect::<Vec<_>>();
        chain.fail_receipts_once(fast[3].hash());

        let err = chain.insert_receipt_chain(fast.clone(), receipts.clone()).unwrap_err();
        assert_eq!(err.index, 3);
        assert_eq!(chain.current_fast_block().number, 3);
        assert_eq!(chain.insert_receipt_chain(fast, receipts), Ok(6));
        assert_eq!(chain.current_fast_block().number, 6);
    }

    #[test]
    fn state_sync_completes_block_state() {
        let blocks = TestBlocks::genesis().extend(4, 0);
        let chain = TestChain::new(&blocks);
        let pivot = blocks.blocks()[3].clone();
        let receipts = blocks.receipts(pivot.hash()).unwrap();
        chain.insert_header_chain(&blocks.headers()[1..], 1).unwrap();
        chain.insert_receipt_chain(vec![pivot.clone()], vec![receipts]).unwrap();
        assert_eq!(
            chain.fast_sync_commit_head(pivot.hash()),
            Err(ProviderError::MissingState(pivot.state_root))
        );

        let mut scheduler = chain.state_sync(pivot.state_root);
        assert_eq!(scheduler.missing(10), vec![pivot.state_root]);
        let root = blocks.node(pivot.state_root).unwrap();
        scheduler.process(pivot.state_root, root.clone()).unwrap();
        assert_matches!(
            scheduler.process(pivot.state_root, root),
            Err(NodeSyncError::AlreadyProcessed(_))
        );
        assert_eq!(scheduler.pending() as u64, TestBlocks::state_size() - 1);

        for hash in scheduler.missing(10) {
            scheduler.process(hash, blocks.node(hash).unwrap()).unwrap();
        }
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.commit(), Ok(TestBlocks::state_size() as usize));
        assert!(chain.has_state(pivot.state_root));
        assert_eq!(chain.fast_sync_commit_head(pivot.hash()), Ok(()));
        assert_eq!(chain.current_block().number, 4);
        assert!(chain.has_block(pivot.hash(), 4));
    }
}
