use crate::Bytes;
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// Receipt containing result of transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Receipt {
    /// If transaction is executed successfully.
    pub success: bool,
    /// Gas used
    pub cumulative_gas_used: u64,
    /// Encoded logs emitted by the transaction.
    pub logs: Bytes,
}
