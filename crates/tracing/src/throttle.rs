//! Rate limiting for repetitive log lines.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::{Duration, Instant},
};

/// Remembers when a guarded expression last ran, one instance per [`throttle!`] call site.
#[doc(hidden)]
#[derive(Debug)]
pub struct Throttle {
    epoch: OnceLock<Instant>,
    /// Milliseconds since `epoch` of the last run, plus one. Zero means never.
    last: AtomicU64,
}

impl Throttle {
    /// A throttle that has never run.
    pub const fn new() -> Self {
        Self { epoch: OnceLock::new(), last: AtomicU64::new(0) }
    }

    /// Claims the next run if at least `period` passed since the previous one.
    ///
    /// Of concurrent callers at most one wins.
    pub fn ready(&self, period: Duration) -> bool {
        let epoch = *self.epoch.get_or_init(Instant::now);
        let now = epoch.elapsed().as_millis() as u64 + 1;
        let last = self.last.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < period.as_millis() as u64 {
            return false
        }
        self.last.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates the expression at most once per `period` for the call site.
///
/// ```ignore
/// use std::time::Duration;
///
/// aqua_tracing::throttle!(Duration::from_secs(1), || {
///     tracing::trace!(target: "downloaders::sync", "Headers from unexpected peer")
/// });
/// ```
#[macro_export]
macro_rules! throttle {
    ($period:expr, || $expr:expr) => {{
        static THROTTLE: $crate::__private::Throttle = $crate::__private::Throttle::new();
        if THROTTLE.ready($period) {
            $expr
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_call_runs() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        for _ in 0..3 {
            throttle!(Duration::from_secs(60), || {
                RUNS.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runs_again_after_period() {
        let throttle = Throttle::new();
        assert!(throttle.ready(Duration::from_millis(20)));
        assert!(!throttle.ready(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.ready(Duration::from_millis(20)));
        assert!(throttle.ready(Duration::ZERO));
    }
}
