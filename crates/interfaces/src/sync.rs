//! Sync modes, progress reporting and sync state tracking.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// How the chain is brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncMode {
    /// Download and execute every block.
    #[default]
    Full,
    /// Download headers, bodies and receipts up to a pivot near the head, the state at the pivot
    /// and execute only the blocks after it.
    Fast,
    /// Never sync from the network.
    Offline,
}

impl SyncMode {
    /// Returns the textual representation of the mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Fast => "fast",
            SyncMode::Offline => "offline",
        }
    }

    /// Whether this is [`SyncMode::Fast`].
    pub const fn is_fast(&self) -> bool {
        matches!(self, SyncMode::Fast)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseSyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "fast" => Ok(SyncMode::Fast),
            "offline" | "none" => Ok(SyncMode::Offline),
            other => Err(ParseSyncModeError(other.to_string())),
        }
    }
}

impl Serialize for SyncMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SyncMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned for an unknown [`SyncMode`] literal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode {0:?}, want \"full\", \"fast\", \"offline\" or \"none\"")]
pub struct ParseSyncModeError(String);

/// A snapshot of the progress of the current or last sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Block number where the current cycle started.
    pub starting_block: u64,
    /// Block number of the local head.
    pub current_block: u64,
    /// Highest block number advertised by the peer being synced with.
    pub highest_block: u64,
    /// Number of state trie nodes downloaded.
    pub pulled_states: u64,
    /// Number of state trie nodes known to be needed.
    pub known_states: u64,
}

/// A type that provides information about whether the node is currently syncing.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SyncStateProvider: Send + Sync {
    /// Returns `true` if a sync cycle is running.
    fn is_syncing(&self) -> bool;
}
