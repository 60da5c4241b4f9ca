//! Commonly used types in aqua.
//!
//! Headers commit to their block contents with [`proofs::ordered_list_hash`]: the keccak256 of
//! the RLP list encoding of the transactions, ommers and receipts respectively.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod block;
mod header;
mod peer;
pub mod proofs;
mod receipt;
mod transaction;

pub use block::{BlockBody, SealedBlock};
pub use header::{Header, SealedHeader};
pub use peer::{PeerId, WithPeerId};
pub use receipt::Receipt;
pub use transaction::Transaction;

pub use alloy_primitives::{self, keccak256, Address, BlockHash, BlockNumber, Bytes, B256, U256};

use alloy_primitives::b256;

/// Commitment of an empty transaction, ommer or receipt list: `keccak256(rlp([]))`.
pub const EMPTY_LIST_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");
