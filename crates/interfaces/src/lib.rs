//! Collaborator traits, errors and shared types for aqua's chain synchronisation.
//!
//! The downloader only talks to the outside world through the traits defined here:
//! [`p2p::SyncPeer`] for remote peers, [`provider::BlockChain`] and [`provider::StateProvider`]
//! for local storage and [`consensus::Consensus`] for header verification.
//!
//! ## Feature Flags
//!
//! - `test-utils`: Export utilities for testing

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

/// Consensus traits.
pub mod consensus;

/// P2P traits and errors.
pub mod p2p;

/// Storage traits.
pub mod provider;

/// Syncing related traits.
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
/// Common test helpers for mocking out Consensus, Downloaders and Header Clients.
pub mod test_utils;
