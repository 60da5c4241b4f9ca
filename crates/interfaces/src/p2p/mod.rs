/// Error types broadly used by p2p interfaces for any operation which may produce an error when
/// interacting with the network implementation
pub mod error;

/// The capability a remote peer exposes to the downloader.
pub mod peer;

pub use error::{RequestError, RequestResult, SyncError, SyncResult};
pub use peer::{PeerCapabilities, SyncPeer};
