use aqua_primitives::{
    keccak256, proofs, Address, BlockBody, BlockNumber, Bytes, Header, Receipt, SealedBlock,
    SealedHeader, Transaction, B256, U256,
};
use std::{collections::HashMap, sync::Arc};

/// Number of leaves of the state trie generated for every block.
const STATE_LEAVES: u8 = 4;

/// Tag of a state node that references children.
pub(crate) const BRANCH_NODE: u8 = 1;

/// Tag of a state node without children.
pub(crate) const LEAF_NODE: u8 = 0;

/// A deterministic chain of blocks, with receipts and a small state trie per block.
///
/// Chains sharing a prefix share the blocks of that prefix, so forks are built by truncating a
/// chain and extending it with a different seed.
#[derive(Debug, Clone)]
pub struct TestBlocks {
    canonical: Vec<B256>,
    blocks: Arc<HashMap<B256, (SealedBlock, Vec<Receipt>)>>,
    nodes: Arc<HashMap<B256, Bytes>>,
    difficulty: u64,
}

impl TestBlocks {
    /// A chain holding only the genesis block.
    pub fn genesis() -> Self {
        let mut nodes = HashMap::new();
        let state_root = generate_state(0, 0, &mut nodes);
        let header =
            Header { difficulty: U256::from(1), state_root, ..Default::default() }.seal_slow();
        let hash = header.hash();
        let block = SealedBlock::new(header, BlockBody::default());
        Self {
            canonical: vec![hash],
            blocks: Arc::new(HashMap::from([(hash, (block, Vec::new()))])),
            nodes: Arc::new(nodes),
            difficulty: 1,
        }
    }

    /// Sets the difficulty of blocks added from now on.
    pub fn with_difficulty(mut self, difficulty: u64) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Appends `count` blocks, every third one carrying a transaction.
    ///
    /// Different seeds produce different blocks at the same height.
    pub fn extend(self, count: usize, seed: u8) -> Self {
        self.extend_with(count, seed, |number| number % 3 == 0)
    }

    /// Appends `count` blocks without transactions.
    pub fn extend_empty(self, count: usize, seed: u8) -> Self {
        self.extend_with(count, seed, |_| false)
    }

    fn extend_with(
        mut self,
        count: usize,
        seed: u8,
        with_tx: impl Fn(BlockNumber) -> bool,
    ) -> Self {
        let mut blocks = (*self.blocks).clone();
        let mut nodes = (*self.nodes).clone();
        for _ in 0..count {
            let parent = blocks[&self.canonical[self.canonical.len() - 1]].0.header.clone();
            let number = parent.number + 1;

            let transactions = if with_tx(number) {
                vec![Transaction {
                    nonce: number,
                    to: Address::with_last_byte(seed),
                    value: U256::from(number),
                    input: Bytes::from(vec![seed]),
                }]
            } else {
                Vec::new()
            };
            let receipts = transactions
                .iter()
                .enumerate()
                .map(|(index, _)| Receipt {
                    success: true,
                    cumulative_gas_used: 21_000 * (index as u64 + 1),
                    logs: Bytes::from(vec![seed]),
                })
                .collect::<Vec<_>>();

            let header = Header {
                parent_hash: parent.hash(),
                number,
                timestamp: number * 10,
                difficulty: U256::from(self.difficulty),
                beneficiary: Address::with_last_byte(seed),
                state_root: generate_state(number, seed, &mut nodes),
                transactions_root: proofs::calculate_transaction_root(&transactions),
                receipts_root: proofs::calculate_receipt_root(&receipts),
                ..Default::default()
            }
            .seal_slow();
            let hash = header.hash();
            let body = BlockBody { transactions, ommers: Vec::new() };
            blocks.insert(hash, (SealedBlock::new(header, body), receipts));
            self.canonical.push(hash);
        }
        self.blocks = Arc::new(blocks);
        self.nodes = Arc::new(nodes);
        self
    }

    /// Keeps the blocks up to and including `number`.
    pub fn truncate(mut self, number: BlockNumber) -> Self {
        self.canonical.truncate(number as usize + 1);
        self
    }

    /// The genesis block.
    pub fn genesis_block(&self) -> SealedBlock {
        self.blocks[&self.canonical[0]].0.clone()
    }

    /// The last block.
    pub fn head(&self) -> SealedHeader {
        self.header(self.height()).expect("chain is never empty")
    }

    /// Number of the last block.
    pub fn height(&self) -> BlockNumber {
        self.canonical.len() as u64 - 1
    }

    /// Total difficulty of the last block.
    pub fn total_difficulty(&self) -> U256 {
        self.canonical.iter().fold(U256::ZERO, |td, hash| td + self.blocks[hash].0.difficulty)
    }

    /// Hash of the block at `number`.
    pub fn hash(&self, number: BlockNumber) -> Option<B256> {
        self.canonical.get(number as usize).copied()
    }

    /// Number of the block, if it is part of this chain.
    pub fn number(&self, hash: B256) -> Option<BlockNumber> {
        let number = self.blocks.get(&hash)?.0.number;
        (self.hash(number) == Some(hash)).then_some(number)
    }

    /// Header of the block at `number`.
    pub fn header(&self, number: BlockNumber) -> Option<SealedHeader> {
        self.hash(number).map(|hash| self.blocks[&hash].0.header.clone())
    }

    /// All headers, genesis included.
    pub fn headers(&self) -> Vec<SealedHeader> {
        self.canonical.iter().map(|hash| self.blocks[hash].0.header.clone()).collect()
    }

    /// All blocks after genesis.
    pub fn blocks(&self) -> Vec<SealedBlock> {
        self.canonical[1..].iter().map(|hash| self.blocks[hash].0.clone()).collect()
    }

    /// The block with the given hash, from this chain or any chain it was forked from.
    pub fn block(&self, hash: B256) -> Option<SealedBlock> {
        self.blocks.get(&hash).map(|(block, _)| block.clone())
    }

    /// The body of the block with the given hash.
    pub fn body(&self, hash: B256) -> Option<BlockBody> {
        self.blocks.get(&hash).map(|(block, _)| block.body.clone())
    }

    /// The receipts of the block with the given hash.
    pub fn receipts(&self, hash: B256) -> Option<Vec<Receipt>> {
        self.blocks.get(&hash).map(|(_, receipts)| receipts.clone())
    }

    /// A state trie node.
    pub fn node(&self, hash: B256) -> Option<Bytes> {
        self.nodes.get(&hash).cloned()
    }

    /// Number of nodes in the state trie of every block.
    pub fn state_size() -> u64 {
        STATE_LEAVES as u64 + 1
    }
}

/// Generates the state trie of a block, returning its root.
fn generate_state(number: BlockNumber, seed: u8, nodes: &mut HashMap<B256, Bytes>) -> B256 {
    let mut root = vec![BRANCH_NODE];
    for leaf in 0..STATE_LEAVES {
        let mut data = vec![LEAF_NODE, seed, leaf];
        data.extend_from_slice(&number.to_be_bytes());
        let hash = keccak256(&data);
        nodes.insert(hash, Bytes::from(data));
        root.extend_from_slice(hash.as_slice());
    }
    let hash = keccak256(&root);
    nodes.insert(hash, Bytes::from(root));
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_chain_links_every_block() {
        let chain = TestBlocks::genesis().extend(10, 0);
        assert_eq!(chain.height(), 10);
        let headers = chain.headers();
        for pair in headers.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].hash());
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
    }

    #[test]
    fn forks_share_the_common_prefix() {
        let base = TestBlocks::genesis().extend(5, 0);
        let fork = base.clone().extend(5, 1);
        let other = base.clone().extend(5, 2);
        assert_eq!(fork.hash(5), other.hash(5));
        assert_ne!(fork.hash(6), other.hash(6));
        assert_eq!(fork.header(6).map(|header| header.parent_hash), base.hash(5));
    }
}
