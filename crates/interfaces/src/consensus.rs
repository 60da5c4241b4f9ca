use aqua_primitives::{BlockNumber, SealedHeader, B256};
use std::fmt::Debug;

/// Header verification as performed by the storage collaborator on insertion.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait Consensus: Debug + Send + Sync {
    /// Validate if header is correct and follows consensus rules.
    ///
    /// **This should not be called for the genesis block**.
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError>;
}

/// Checks the fields of `header` that can be verified from its parent alone.
pub fn validate_header_against_parent(
    header: &SealedHeader,
    parent: &SealedHeader,
) -> Result<(), ConsensusError> {
    if parent.number() + 1 != header.number() {
        return Err(ConsensusError::ParentBlockNumberMismatch {
            parent_block_number: parent.number(),
            block_number: header.number(),
        })
    }
    if parent.hash() != header.parent_hash {
        return Err(ConsensusError::ParentHashMismatch {
            expected: parent.hash(),
            got: header.parent_hash,
        })
    }
    if header.timestamp < parent.timestamp {
        return Err(ConsensusError::TimestampIsInPast {
            parent_timestamp: parent.timestamp,
            timestamp: header.timestamp,
        })
    }
    Ok(())
}

/// Consensus Errors
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum ConsensusError {
    #[error("Block number {block_number} does not match parent block number {parent_block_number}")]
    ParentBlockNumberMismatch { parent_block_number: BlockNumber, block_number: BlockNumber },
    #[error("Parent hash {got} does not match the expected {expected}")]
    ParentHashMismatch { expected: B256, got: B256 },
    #[error("Block timestamp {timestamp} is in past in comparison with parent timestamp {parent_timestamp}.")]
    TimestampIsInPast { parent_timestamp: u64, timestamp: u64 },
    #[error("Header {hash} failed seal verification")]
    InvalidSeal { hash: B256 },
}
