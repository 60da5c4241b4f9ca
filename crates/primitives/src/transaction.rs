use crate::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};

/// A value transfer or contract call carried in a block body.
///
/// Signatures and fee fields are verified by the execution layer and are opaque to the
/// downloader, which only needs the encoding to check body commitments.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Transaction {
    /// Sender nonce.
    pub nonce: u64,
    /// Recipient.
    pub to: Address,
    /// Transferred value.
    pub value: U256,
    /// Call data.
    pub input: Bytes,
}

impl Transaction {
    /// Computes the hash of the RLP encoded transaction.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(buf)
    }
}
