#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub, unused_crate_dependencies)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
#![allow(clippy::result_large_err)]

//! Synchronises the local chain with remote peers.
//!
//! The [`Downloader`] runs sync cycles against a single origin peer at a time: it locates the
//! common ancestor, pulls a header skeleton from the origin, lets every registered peer fill the
//! skeleton and retrieve bodies and receipts, and hands completed blocks to the local chain in
//! order. In fast sync the blocks below a pivot near the head are stored without execution and
//! the state at the pivot is retrieved instead.
//!
//! ## Feature Flags
//!
//! - `test-utils`: Export utilities for testing

mod ancestor;
mod cache;
mod downloader;
mod fetch;
mod metrics;
mod observer;
mod state;

pub mod peers;
pub mod queue;
pub mod reputation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use downloader::{Downloader, DownloaderBuilder, RegisterError};
pub use observer::{NoopObserver, SyncObserver};
pub use peers::{ContentKind, PeerConnection, PeerSet, PeerSetError};
pub use queue::{DeliveryError, FetchRequest, FetchResult, Reservation, ResultQueue};
pub use reputation::{ReputationChangeKind, ReputationChangeWeights};
