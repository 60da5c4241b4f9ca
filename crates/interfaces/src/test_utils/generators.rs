use aqua_primitives::{
    proofs, Address, BlockBody, Bytes, Header, Receipt, SealedBlock, SealedHeader, Transaction,
    B256, U256,
};
use rand::{thread_rng, Rng};

/// Generates a range of random [SealedHeader]s.
///
/// The parent hash of the first header
/// in the result will be equal to `head`.
///
/// The headers are assumed to not be correct if validated.
pub fn random_header_range(rng: std::ops::Range<u64>, head: B256) -> Vec<SealedHeader> {
    let mut headers = Vec::with_capacity(rng.end.saturating_sub(rng.start) as usize);
    for idx in rng {
        headers.push(random_header(
            idx,
            Some(headers.last().map(|h: &SealedHeader| h.hash()).unwrap_or(head)),
        ));
    }
    headers
}

/// Generate a random [SealedHeader].
///
/// The header commits to an empty body.
pub fn random_header(number: u64, parent: Option<B256>) -> SealedHeader {
    let header = Header {
        number,
        timestamp: number,
        beneficiary: Address::from(rand::random::<[u8; 20]>()),
        difficulty: U256::from(rand::random::<u32>()),
        parent_hash: parent.unwrap_or_default(),
        ..Default::default()
    };
    header.seal_slow()
}

/// Generates a random transaction.
pub fn random_tx() -> Transaction {
    let mut rng = thread_rng();
    Transaction {
        nonce: rng.gen(),
        to: Address::from(rng.gen::<[u8; 20]>()),
        value: U256::from(rng.gen::<u64>()),
        input: Bytes::from(rng.gen::<[u8; 8]>().to_vec()),
    }
}

/// Generates a receipt for a transaction at position `index` of its block.
pub fn random_receipt(index: u64) -> Receipt {
    Receipt {
        success: thread_rng().gen_bool(0.9),
        cumulative_gas_used: 21_000 * (index + 1),
        logs: Bytes::from(thread_rng().gen::<[u8; 4]>().to_vec()),
    }
}

/// Generate a random block filled with `tx_count` transactions and `ommers_count` ommers.
///
/// The header commits to the generated body and receipts, the returned receipts hold one entry
/// per transaction.
pub fn random_block(
    number: u64,
    parent: Option<B256>,
    tx_count: usize,
    ommers_count: usize,
) -> (SealedBlock, Vec<Receipt>) {
    let transactions = (0..tx_count).map(|_| random_tx()).collect::<Vec<_>>();
    let ommers = (0..ommers_count)
        .map(|_| random_header(number.saturating_sub(1), parent).unseal())
        .collect::<Vec<_>>();
    let receipts = (0..tx_count as u64).map(random_receipt).collect::<Vec<_>>();

    let header = Header {
        parent_hash: parent.unwrap_or_default(),
        number,
        timestamp: number,
        difficulty: U256::from(1),
        transactions_root: proofs::calculate_transaction_root(&transactions),
        ommers_hash: proofs::calculate_ommers_root(&ommers),
        receipts_root: proofs::calculate_receipt_root(&receipts),
        ..Default::default()
    };

    (SealedBlock::new(header.seal_slow(), BlockBody { transactions, ommers }), receipts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_range_is_linked() {
        let headers = random_header_range(5..10, B256::with_last_byte(9));
        assert_eq!(headers.len(), 5);
        assert_eq!(headers[0].parent_hash, B256::with_last_byte(9));
        for pair in headers.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].hash());
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
    }

    #[test]
    fn random_block_commits_to_contents() {
        let (block, receipts) = random_block(3, None, 2, 1);
        assert!(block.body.matches_header(&block.header));
        assert_eq!(proofs::calculate_receipt_root(&receipts), block.receipts_root);
        assert!(!block.has_empty_body());

        let (empty, receipts) = random_block(4, Some(block.hash()), 0, 0);
        assert!(empty.has_empty_body());
        assert!(empty.has_empty_receipts());
        assert!(receipts.is_empty());
    }
}
