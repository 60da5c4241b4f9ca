//! Helpers for computing the list commitments stored in headers.

use crate::{keccak256, Header, Receipt, Transaction, B256};
use alloy_rlp::Encodable;

/// Hashes the RLP list encoding of `items`.
pub fn ordered_list_hash<T: Encodable>(items: &[T]) -> B256 {
    let mut buf = Vec::new();
    alloy_rlp::encode_list::<T, T>(items, &mut buf);
    keccak256(buf)
}

/// Calculate the transactions root of a block body.
pub fn calculate_transaction_root(transactions: &[Transaction]) -> B256 {
    ordered_list_hash(transactions)
}

/// Calculate the ommers hash of a block body.
pub fn calculate_ommers_root(ommers: &[Header]) -> B256 {
    ordered_list_hash(ommers)
}

/// Calculate the receipts root of a block.
pub fn calculate_receipt_root(receipts: &[Receipt]) -> B256 {
    ordered_list_hash(receipts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bytes, EMPTY_LIST_HASH, U256};

    #[test]
    fn empty_lists_hash_to_empty_root() {
        assert_eq!(calculate_transaction_root(&[]), EMPTY_LIST_HASH);
        assert_eq!(calculate_ommers_root(&[]), EMPTY_LIST_HASH);
        assert_eq!(calculate_receipt_root(&[]), EMPTY_LIST_HASH);
    }

    #[test]
    fn root_depends_on_order() {
        let a = Transaction { nonce: 0, value: U256::from(1), ..Default::default() };
        let b = Transaction { nonce: 1, input: Bytes::from_static(b"aqua"), ..Default::default() };

        let forward = calculate_transaction_root(&[a.clone(), b.clone()]);
        let backward = calculate_transaction_root(&[b, a]);
        assert_ne!(forward, backward);
        assert_ne!(forward, EMPTY_LIST_HASH);
    }
}
