//! Peer reputation management

use aqua_interfaces::p2p::SyncError;

/// The type that tracks the reputation score.
pub type Reputation = i32;

/// The default reputation of a peer
pub const DEFAULT_REPUTATION: Reputation = 0;

/// The minimal unit we're measuring reputation
const REPUTATION_UNIT: i32 = -1024;

/// The reputation value below which a peer is refused by the peer set.
pub const BANNED_REPUTATION: i32 = 50 * REPUTATION_UNIT;

/// The reputation change to apply to a peer that failed to respond in time.
const TIMEOUT_REPUTATION_CHANGE: i32 = 4 * REPUTATION_UNIT;

/// The reputation change to apply to a peer that sent a bad message.
const BAD_MESSAGE_REPUTATION_CHANGE: i32 = 16 * REPUTATION_UNIT;

/// The reputation change to apply to a peer that served content not matching its header.
const BAD_BLOCK_REPUTATION_CHANGE: i32 = 16 * REPUTATION_UNIT;

/// The reputation change to apply to a peer which violates protocol rules: minimal reputation
const BAD_PROTOCOL_REPUTATION_CHANGE: i32 = i32::MIN;

/// Returns `true` if the given reputation is below the [`BANNED_REPUTATION`] threshold
#[inline]
pub const fn is_banned_reputation(reputation: i32) -> bool {
    reputation < BANNED_REPUTATION
}

/// Various kinds of reputation changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReputationChangeKind {
    /// Received an unspecific bad message from the peer
    BadMessage,
    /// Peer sent a body or receipts that do not match the header.
    BadBlock,
    /// Peer failed to respond in time.
    Timeout,
    /// Peer does not adhere to network protocol rules.
    BadProtocol,
    /// Reset the reputation to the default value.
    Reset,
    /// Apply a reputation change by value
    Other(Reputation),
}

impl ReputationChangeKind {
    /// Returns true if the reputation change is a [`ReputationChangeKind::Reset`].
    pub const fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }

    /// The penalty matching a failed sync cycle, if the failure is the peer's fault.
    pub fn from_sync_error(err: &SyncError) -> Option<Self> {
        match err {
            SyncError::Timeout | SyncError::StallingPeer | SyncError::PeersUnavailable => {
                Some(Self::Timeout)
            }
            SyncError::BadPeer |
            SyncError::EmptyHeaderSet |
            SyncError::InvalidAncestor |
            SyncError::InvalidChain => Some(Self::BadMessage),
            _ => None,
        }
    }
}

/// How the [`ReputationChangeKind`] are weighted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationChangeWeights {
    /// Weight for [`ReputationChangeKind::BadMessage`]
    pub bad_message: Reputation,
    /// Weight for [`ReputationChangeKind::BadBlock`]
    pub bad_block: Reputation,
    /// Weight for [`ReputationChangeKind::Timeout`]
    pub timeout: Reputation,
    /// Weight for [`ReputationChangeKind::BadProtocol`]
    pub bad_protocol: Reputation,
}

// === impl ReputationChangeWeights ===

impl ReputationChangeWeights {
    /// Creates a new instance that doesn't penalize any kind of reputation change.
    pub const fn zero() -> Self {
        Self { bad_message: 0, bad_block: 0, timeout: 0, bad_protocol: 0 }
    }

    /// Returns the reputation delta for the given [`ReputationChangeKind`].
    ///
    /// [`ReputationChangeKind::Reset`] is not a delta and maps to zero, callers handle it.
    pub const fn change(&self, kind: ReputationChangeKind) -> Reputation {
        match kind {
            ReputationChangeKind::BadMessage => self.bad_message,
            ReputationChangeKind::BadBlock => self.bad_block,
            ReputationChangeKind::Timeout => self.timeout,
            ReputationChangeKind::BadProtocol => self.bad_protocol,
            ReputationChangeKind::Reset => 0,
            ReputationChangeKind::Other(val) => val,
        }
    }
}

impl Default for ReputationChangeWeights {
    fn default() -> Self {
        Self {
            bad_message: BAD_MESSAGE_REPUTATION_CHANGE,
            bad_block: BAD_BLOCK_REPUTATION_CHANGE,
            timeout: TIMEOUT_REPUTATION_CHANGE,
            bad_protocol: BAD_PROTOCOL_REPUTATION_CHANGE,
        }
    }
}
