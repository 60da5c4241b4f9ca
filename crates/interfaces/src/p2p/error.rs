use crate::provider::ProviderError;
use thiserror::Error;

/// Result alias for result of a request.
pub type RequestResult<T> = Result<T, RequestError>;

/// Error variants that can happen when sending requests to a session.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RequestError {
    #[error("Closed channel to the peer.")]
    ChannelClosed,
    #[error("Connection to a peer dropped while handling the request.")]
    ConnectionDropped,
    #[error("Capability Message is not supported by remote peer.")]
    UnsupportedCapability,
    #[error("Peer is already serving a request of this kind.")]
    AlreadyFetching,
}

// === impl RequestError ===

impl RequestError {
    /// Indicates whether this error is retryable or fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::ConnectionDropped | RequestError::AlreadyFetching)
    }

    /// Whether the error happened because the channel was closed.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, RequestError::ChannelClosed)
    }
}

/// The sync result type
pub type SyncResult<T> = Result<T, SyncError>;

/// Everything that can end a sync cycle or reject a call into the downloader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Another sync cycle is already running.
    #[error("busy")]
    Busy,
    /// The peer is not (or no longer) registered.
    #[error("peer is unknown or unhealthy")]
    UnknownPeer,
    /// The peer sent structurally invalid data.
    #[error("action from bad peer ignored")]
    BadPeer,
    /// The peer failed to make the progress it promised.
    #[error("peer is stalling")]
    StallingPeer,
    /// Every peer left while the cycle was running.
    #[error("no peers to keep download active")]
    NoPeers,
    /// No answer arrived in time.
    #[error("timeout")]
    Timeout,
    /// The peer answered with zero headers where a dead end is implied.
    #[error("empty header set by peer")]
    EmptyHeaderSet,
    /// None of the idle peers has the data still pending.
    #[error("no peers available or all tried for download")]
    PeersUnavailable,
    /// The common ancestor lies deeper than the fork ancestry bound.
    #[error("retrieved ancestor is invalid")]
    InvalidAncestor,
    /// Hash chain continuity is violated.
    #[error("retrieved hash chain is invalid")]
    InvalidChain,
    /// A block failed validation.
    #[error("retrieved block is invalid")]
    InvalidBlock,
    /// A body does not match its header.
    #[error("retrieved block body is invalid")]
    InvalidBody,
    /// A receipt list does not match its header.
    #[error("retrieved receipt is invalid")]
    InvalidReceipt,
    /// Block retrieval was cancelled.
    #[error("block download canceled (requested)")]
    CancelBlockFetch,
    /// Header retrieval was cancelled.
    #[error("block header download canceled (requested)")]
    CancelHeaderFetch,
    /// Body retrieval was cancelled.
    #[error("block body download canceled (requested)")]
    CancelBodyFetch,
    /// Receipt retrieval was cancelled.
    #[error("receipt download canceled (requested)")]
    CancelReceiptFetch,
    /// State retrieval was cancelled.
    #[error("state data download canceled (requested)")]
    CancelStateFetch,
    /// Header processing was cancelled.
    #[error("block header processing canceled (requested)")]
    CancelHeaderProcessing,
    /// Content processing was cancelled.
    #[error("content processing canceled (requested)")]
    CancelContentProcessing,
    /// A delivery arrived while no cycle is running.
    #[error("no sync active")]
    NoSyncActive,
    /// The downloader was shut down.
    #[error("downloader terminated")]
    Terminated,
    /// Issuing a request to a peer failed.
    #[error(transparent)]
    Request(#[from] RequestError),
    /// Local storage refused a write that does not implicate the peer.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

// === impl SyncError ===

impl SyncError {
    /// Whether the peer the cycle ran against should be disconnected.
    ///
    /// Content errors raised while fetching from other peers do not implicate the origin peer.
    pub fn should_drop_peer(&self) -> bool {
        matches!(
            self,
            SyncError::BadPeer |
                SyncError::StallingPeer |
                SyncError::Timeout |
                SyncError::EmptyHeaderSet |
                SyncError::PeersUnavailable |
                SyncError::InvalidAncestor |
                SyncError::InvalidChain
        )
    }

    /// Whether the error is the result of the cycle being cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SyncError::CancelBlockFetch |
                SyncError::CancelHeaderFetch |
                SyncError::CancelBodyFetch |
                SyncError::CancelReceiptFetch |
                SyncError::CancelStateFetch |
                SyncError::CancelHeaderProcessing |
                SyncError::CancelContentProcessing
        )
    }

    /// Whether retrying against another peer is likely to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout | SyncError::NoPeers => true,
            SyncError::Request(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_classification() {
        let drop = [
            SyncError::BadPeer,
            SyncError::StallingPeer,
            SyncError::Timeout,
            SyncError::EmptyHeaderSet,
            SyncError::PeersUnavailable,
            SyncError::InvalidAncestor,
            SyncError::InvalidChain,
        ];
        let keep = [
            SyncError::Busy,
            SyncError::UnknownPeer,
            SyncError::NoPeers,
            SyncError::InvalidBlock,
            SyncError::InvalidBody,
            SyncError::InvalidReceipt,
            SyncError::CancelBlockFetch,
            SyncError::CancelHeaderFetch,
            SyncError::CancelBodyFetch,
            SyncError::CancelReceiptFetch,
            SyncError::CancelStateFetch,
            SyncError::CancelHeaderProcessing,
            SyncError::CancelContentProcessing,
            SyncError::NoSyncActive,
            SyncError::Terminated,
            SyncError::Request(RequestError::ConnectionDropped),
            SyncError::Provider(ProviderError::UnknownBlock(Default::default())),
        ];
        for err in drop {
            assert!(err.should_drop_peer(), "{err:?} should drop the peer");
        }
        for err in keep {
            assert!(!err.should_drop_peer(), "{err:?} should keep the peer");
        }
    }

    #[test]
    fn request_error_classification() {
        assert!(RequestError::ChannelClosed.is_channel_closed());
        assert!(!RequestError::ChannelClosed.is_retryable());
        assert!(RequestError::AlreadyFetching.is_retryable());
        assert!(!RequestError::UnsupportedCapability.is_retryable());
    }

    #[test]
    fn cancellations_are_not_retryable() {
        assert!(SyncError::CancelHeaderFetch.is_cancellation());
        assert!(!SyncError::CancelHeaderFetch.is_retryable());
        assert!(!SyncError::Timeout.is_cancellation());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Request(RequestError::ConnectionDropped).is_retryable());
        assert!(!SyncError::Request(RequestError::ChannelClosed).is_retryable());
    }
}
