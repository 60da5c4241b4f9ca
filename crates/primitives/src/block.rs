use crate::{proofs, BlockHash, BlockNumber, Header, SealedHeader, Transaction};
use std::ops::Deref;

/// The contents of a block that are not part of its header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    /// Transactions in the block
    pub transactions: Vec<Transaction>,
    /// Uncle headers for the given block
    pub ommers: Vec<Header>,
}

impl BlockBody {
    /// Returns true if the body has neither transactions nor ommers.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.ommers.is_empty()
    }

    /// Returns true if the body hashes to the commitments found in `header`.
    pub fn matches_header(&self, header: &Header) -> bool {
        proofs::calculate_transaction_root(&self.transactions) == header.transactions_root &&
            proofs::calculate_ommers_root(&self.ommers) == header.ommers_hash
    }
}

/// Sealed Ethereum full block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    /// Locked block header.
    pub header: SealedHeader,
    /// Transactions and ommers.
    pub body: BlockBody,
}

impl SealedBlock {
    /// Create a new sealed block instance.
    pub fn new(header: SealedHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    /// Header hash.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Block number.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Splits the sealed block into underlying components
    pub fn split(self) -> (SealedHeader, BlockBody) {
        (self.header, self.body)
    }
}

impl Deref for SealedBlock {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}
