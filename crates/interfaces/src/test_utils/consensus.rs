use crate::consensus::{validate_header_against_parent, Consensus, ConsensusError};
use aqua_primitives::SealedHeader;
use std::sync::atomic::{AtomicBool, Ordering};

/// Consensus engine implementation for testing
#[derive(Debug, Default)]
pub struct TestConsensus {
    /// Flag whether the header validation should purposefully fail
    fail_validation: AtomicBool,
}

impl TestConsensus {
    /// Get the failed validation flag
    pub fn fail_validation(&self) -> bool {
        self.fail_validation.load(Ordering::SeqCst)
    }

    /// Update the validation flag
    pub fn set_fail_validation(&self, val: bool) {
        self.fail_validation.store(val, Ordering::SeqCst)
    }
}

impl Consensus for TestConsensus {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        if self.fail_validation() {
            return Err(ConsensusError::InvalidSeal { hash: header.hash() })
        }
        validate_header_against_parent(header, parent)
    }
}
