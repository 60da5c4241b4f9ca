use crate::peers::ContentKind;
use metrics::{Counter, Gauge, Label};
use metrics_derive::Metrics;

/// Sync cycle metrics.
#[derive(Metrics)]
#[metrics(scope = "downloaders.sync")]
pub(crate) struct SyncMetrics {
    /// Number of sync cycles started
    pub(crate) cycles_started: Counter,
    /// Number of sync cycles that completed successfully
    pub(crate) cycles_completed: Counter,
    /// Number of sync cycles that failed
    pub(crate) cycles_failed: Counter,
    /// Number of times headers were rolled back after a failed cycle
    pub(crate) rollbacks: Counter,
    /// Number of blocks inserted into the chain
    pub(crate) blocks_inserted: Counter,
    /// Number of peers dropped for not delivering
    pub(crate) dropped_peers: Counter,
    /// The highest block advertised by the peer being synced with
    pub(crate) highest_block: Gauge,
    /// Result slots in use
    pub(crate) cached_results: Gauge,
    /// Number of state nodes downloaded
    pub(crate) pulled_states: Counter,
}

/// Metrics of retrieving one kind of content.
#[derive(Clone, Metrics)]
#[metrics(scope = "downloaders.fetch")]
pub(crate) struct FetchMetrics {
    /// Number of requests sent
    pub(crate) requests: Counter,
    /// Number of items accepted
    pub(crate) delivered: Counter,
    /// Number of requests that timed out
    pub(crate) timeouts: Counter,
    /// Number of deliveries rejected as invalid
    pub(crate) invalid_deliveries: Counter,
    /// Number of times retrieval was paused for a full result window
    pub(crate) throttled: Counter,
    /// Tasks waiting to be assigned to a peer
    pub(crate) pending_tasks: Gauge,
}

/// [`FetchMetrics`] per [`ContentKind`].
#[derive(Clone)]
pub(crate) struct ContentMetrics {
    kinds: [FetchMetrics; 4],
}

impl ContentMetrics {
    pub(crate) fn get(&self, kind: ContentKind) -> &FetchMetrics {
        &self.kinds[kind as usize]
    }
}

impl Default for ContentMetrics {
    fn default() -> Self {
        Self {
            kinds: ContentKind::ALL.map(|kind| {
                FetchMetrics::new_with_labels(vec![Label::new("kind", kind.as_str())])
            }),
        }
    }
}
