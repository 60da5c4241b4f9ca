use crate::{keccak256, Address, BlockHash, BlockNumber, Bytes, B256, EMPTY_LIST_HASH, U256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use std::ops::Deref;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct Header {
    /// The Keccak 256-bit hash of the parent block’s header, in its entirety.
    pub parent_hash: B256,
    /// Commitment to the ommers list of this block.
    pub ommers_hash: B256,
    /// The 160-bit address to which all fees collected from the successful mining of this block
    /// be transferred.
    pub beneficiary: Address,
    /// Root of the state trie after all transactions are executed.
    pub state_root: B256,
    /// Commitment to the transaction list of this block.
    pub transactions_root: B256,
    /// Commitment to the receipts of each transaction in this block.
    pub receipts_root: B256,
    /// A scalar value corresponding to the difficulty level of this block.
    pub difficulty: U256,
    /// Number of ancestor blocks. The genesis block has a number of zero.
    pub number: BlockNumber,
    /// Unix time at the block's inception.
    pub timestamp: u64,
    /// Arbitrary data, 32 bytes or fewer.
    pub extra_data: Bytes,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            parent_hash: Default::default(),
            ommers_hash: EMPTY_LIST_HASH,
            beneficiary: Default::default(),
            state_root: Default::default(),
            transactions_root: EMPTY_LIST_HASH,
            receipts_root: EMPTY_LIST_HASH,
            difficulty: Default::default(),
            number: 0,
            timestamp: 0,
            extra_data: Default::default(),
        }
    }
}

impl Header {
    /// Heavy function that will calculate hash of data and will *not* save the change to metadata.
    /// Use [`Header::seal_slow`] and unlock if you need the hash to be persistent.
    pub fn hash_slow(&self) -> BlockHash {
        let mut out = Vec::with_capacity(self.length());
        self.encode(&mut out);
        keccak256(&out)
    }

    /// Calculate hash and seal the Header so that it can't be changed.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader { header: self, hash }
    }

    /// Returns true if the header commits to a body without transactions and ommers.
    ///
    /// Such bodies never need to be fetched from the network.
    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == EMPTY_LIST_HASH && self.ommers_hash == EMPTY_LIST_HASH
    }

    /// Returns true if the header commits to an empty receipt list.
    pub fn has_empty_receipts(&self) -> bool {
        self.receipts_root == EMPTY_LIST_HASH
    }
}

/// A [`Header`] that is sealed at a precalculated hash, use [`SealedHeader::unseal()`] if you
/// want to modify header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SealedHeader {
    header: Header,
    hash: BlockHash,
}

impl SealedHeader {
    /// Creates the sealed header with the corresponding block hash.
    ///
    /// The hash is trusted, use [`Header::seal_slow`] to compute it.
    pub fn new(header: Header, hash: BlockHash) -> Self {
        Self { header, hash }
    }

    /// Returns the sealed header's hash
    #[inline]
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Returns the block number
    #[inline]
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Returns the wrapped header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Extract raw header that can be modified.
    pub fn unseal(self) -> Header {
        self.header
    }

    /// Split into the header and its hash.
    pub fn split(self) -> (Header, BlockHash) {
        (self.header, self.hash)
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_commits_to_empty_content() {
        let header = Header::default();
        assert!(header.has_empty_body());
        assert!(header.has_empty_receipts());

        let header = Header { transactions_root: B256::with_last_byte(1), ..Default::default() };
        assert!(!header.has_empty_body());
        assert!(header.has_empty_receipts());
    }

    #[test]
    fn seal_matches_hash_slow() {
        let header = Header { number: 7, difficulty: U256::from(131_072), ..Default::default() };
        let expected = header.hash_slow();
        let sealed = header.clone().seal_slow();
        assert_eq!(sealed.hash(), expected);
        assert_eq!(sealed.number(), 7);
        assert_eq!(sealed.unseal(), header);
    }

    #[test]
    fn hash_covers_parent() {
        let a = Header { number: 1, ..Default::default() };
        let b = Header { parent_hash: B256::with_last_byte(1), ..a.clone() };
        assert_ne!(a.hash_slow(), b.hash_slow());
    }
}
