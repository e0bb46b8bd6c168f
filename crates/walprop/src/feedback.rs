//! Feedback aggregation and the state shared with the WAL source.
//!
//! Every acceptor relays hot standby and storage feedback in its append
//! responses. The proposer folds the feedback of all streaming acceptors into
//! one snapshot and publishes it in [`SharedState`], where the process
//! generating WAL reads it to decide on backpressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use walprop_config::BackpressureConfig;
use walprop_types::{Lsn, Term};
use walprop_wire::{HotStandbyFeedback, StorageFeedback};

// ============================================================================
// Aggregation
// ============================================================================

/// Feedback of all streaming acceptors, folded into one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatedFeedback {
    /// Minimum non-zero xmins, latest timestamp.
    pub hot_standby: HotStandbyFeedback,
    /// Minimum of each LSN watermark, maximum size and reply time. `None`
    /// until some acceptor relays storage feedback.
    pub storage: Option<StorageFeedback>,
}

fn min_nonzero(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

impl AggregatedFeedback {
    /// Folds the feedback of one acceptor into the aggregate.
    pub fn merge(
        &mut self,
        hot_standby: &HotStandbyFeedback,
        storage: Option<&StorageFeedback>,
    ) {
        let hs = &mut self.hot_standby;
        hs.xmin = min_nonzero(hs.xmin, hot_standby.xmin);
        hs.catalog_xmin = min_nonzero(hs.catalog_xmin, hot_standby.catalog_xmin);
        hs.ts = hs.ts.max(hot_standby.ts);

        let Some(fb) = storage else { return };
        self.storage = Some(match self.storage {
            None => *fb,
            Some(agg) => StorageFeedback {
                current_timeline_size: agg.current_timeline_size.max(fb.current_timeline_size),
                last_received_lsn: agg.last_received_lsn.min(fb.last_received_lsn),
                disk_consistent_lsn: agg.disk_consistent_lsn.min(fb.disk_consistent_lsn),
                remote_consistent_lsn: agg.remote_consistent_lsn.min(fb.remote_consistent_lsn),
                replytime: agg.replytime.max(fb.replytime),
            },
        });
    }

    /// Aggregates a set of `(hot standby, storage)` reports.
    pub fn from_reports<'a>(
        reports: impl IntoIterator<Item = (&'a HotStandbyFeedback, Option<&'a StorageFeedback>)>,
    ) -> Self {
        let mut agg = Self::default();
        for (hs, storage) in reports {
            agg.merge(hs, storage);
        }
        agg
    }
}

// ============================================================================
// Backpressure
// ============================================================================

/// Replication lag limits in bytes; zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackpressureLimits {
    pub max_write_lag: u64,
    pub max_flush_lag: u64,
    pub max_apply_lag: u64,
}

impl From<&BackpressureConfig> for BackpressureLimits {
    fn from(config: &BackpressureConfig) -> Self {
        Self {
            max_write_lag: config.write_lag_bytes(),
            max_flush_lag: config.flush_lag_bytes(),
            max_apply_lag: config.apply_lag_bytes(),
        }
    }
}

/// How far storage is behind a WAL position, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationLag {
    pub write: u64,
    pub flush: u64,
    pub apply: u64,
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the proposer and the rest of the process.
///
/// The proposer is the only writer; any thread may read.
#[derive(Debug, Default)]
pub struct SharedState {
    feedback: Mutex<AggregatedFeedback>,
    mine_last_elected_term: AtomicU64,
    backpressure_throttling_time_us: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_feedback(&self) -> MutexGuard<'_, AggregatedFeedback> {
        // The snapshot stays consistent even if a reader panicked.
        self.feedback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn feedback(&self) -> AggregatedFeedback {
        *self.lock_feedback()
    }

    /// Stores `feedback`; returns whether the snapshot changed.
    pub fn publish_feedback(&self, feedback: AggregatedFeedback) -> bool {
        let mut current = self.lock_feedback();
        if *current == feedback {
            return false;
        }
        *current = feedback;
        true
    }

    pub fn mine_last_elected_term(&self) -> Term {
        Term::new(self.mine_last_elected_term.load(Ordering::Acquire))
    }

    pub fn set_mine_last_elected_term(&self, term: Term) {
        self.mine_last_elected_term
            .store(term.as_u64(), Ordering::Release);
    }

    /// Lag of storage behind `current`; zero for watermarks never reported.
    pub fn replication_lag(&self, current: Lsn) -> ReplicationLag {
        let Some(storage) = self.feedback().storage else {
            return ReplicationLag::default();
        };
        let lag = |lsn: Lsn| {
            if lsn.is_valid() {
                lsn.lag_behind(current)
            } else {
                0
            }
        };
        ReplicationLag {
            write: lag(storage.last_received_lsn),
            flush: lag(storage.disk_consistent_lsn),
            apply: lag(storage.remote_consistent_lsn),
        }
    }

    /// Bytes by which the first exceeded limit is overshot, or zero when the
    /// WAL writer need not be throttled.
    pub fn backpressure_lag(&self, current: Lsn, limits: &BackpressureLimits) -> u64 {
        let lag = self.replication_lag(current);
        [
            (lag.write, limits.max_write_lag),
            (lag.flush, limits.max_flush_lag),
            (lag.apply, limits.max_apply_lag),
        ]
        .into_iter()
        .find(|&(lag, max)| max > 0 && lag > max)
        .map_or(0, |(lag, max)| lag - max)
    }

    pub fn add_throttling_time(&self, duration: Duration) {
        self.backpressure_throttling_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Total time the WAL writer spent throttled.
    pub fn throttling_time(&self) -> Duration {
        Duration::from_micros(self.backpressure_throttling_time_us.load(Ordering::Relaxed))
    }
}
