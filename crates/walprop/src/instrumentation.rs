//! Process-wide proposer metrics.
//!
//! - **Counters**: elections, epoch restarts, reconnects, resets, traffic
//! - **Gauges**: current term, commit LSN, truncate LSN, active peers
//! - **Latency**: election duration (first greeting quorum → elected)
//!
//! ```ignore
//! use walprop::instrumentation::METRICS;
//!
//! METRICS.increment_elections_won();
//! METRICS.set_commit_lsn(commit_lsn.as_u64());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Production Metrics
// ============================================================================

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

const ELECTION_BUCKETS_MS: [f64; 7] = [1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0];

/// Proposer metrics; all fields are relaxed atomics.
#[derive(Debug)]
pub struct Metrics {
    // === Election ===
    elections_won_total: AtomicU64,
    epochs_restarted_total: AtomicU64,
    election_latency_buckets: [AtomicU64; 7],
    election_latency_sum_ns: AtomicU64,
    election_latency_count: AtomicU64,

    // === Connections ===
    reconnect_attempts_total: AtomicU64,
    connection_resets_total: AtomicU64,

    // === Traffic ===
    append_requests_sent_total: AtomicU64,
    wal_bytes_sent_total: AtomicU64,
    append_responses_received_total: AtomicU64,

    // === Gauges ===
    current_term: AtomicU64,
    commit_lsn: AtomicU64,
    truncate_lsn: AtomicU64,
    active_peers: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            elections_won_total: AtomicU64::new(0),
            epochs_restarted_total: AtomicU64::new(0),
            election_latency_buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            election_latency_sum_ns: AtomicU64::new(0),
            election_latency_count: AtomicU64::new(0),

            reconnect_attempts_total: AtomicU64::new(0),
            connection_resets_total: AtomicU64::new(0),

            append_requests_sent_total: AtomicU64::new(0),
            wal_bytes_sent_total: AtomicU64::new(0),
            append_responses_received_total: AtomicU64::new(0),

            current_term: AtomicU64::new(0),
            commit_lsn: AtomicU64::new(0),
            truncate_lsn: AtomicU64::new(0),
            active_peers: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn increment_elections_won(&self) {
        self.elections_won_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_epochs_restarted(&self) {
        self.epochs_restarted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connection_resets(&self) {
        self.connection_resets_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one append request carrying `wal_bytes` bytes of WAL.
    pub fn record_append_sent(&self, wal_bytes: u64) {
        self.append_requests_sent_total.fetch_add(1, Ordering::Relaxed);
        self.wal_bytes_sent_total.fetch_add(wal_bytes, Ordering::Relaxed);
    }

    pub fn increment_append_responses(&self) {
        self.append_responses_received_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long an election took.
    ///
    /// Buckets: [1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1000ms, +Inf]
    pub fn record_election_latency(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        if let Some(i) = ELECTION_BUCKETS_MS.iter().position(|&bound| ms <= bound) {
            self.election_latency_buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.election_latency_sum_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.election_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Gauges
    // ========================================================================

    pub fn set_current_term(&self, term: u64) {
        self.current_term.store(term, Ordering::Relaxed);
    }

    pub fn set_commit_lsn(&self, lsn: u64) {
        self.commit_lsn.store(lsn, Ordering::Relaxed);
    }

    pub fn set_truncate_lsn(&self, lsn: u64) {
        self.truncate_lsn.store(lsn, Ordering::Relaxed);
    }

    pub fn set_active_peers(&self, count: u64) {
        self.active_peers.store(count, Ordering::Relaxed);
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Exports all metrics in Prometheus exposition format.
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut output = String::new();

        let counters = [
            ("walprop_elections_won_total", "Elections won", &self.elections_won_total),
            (
                "walprop_epochs_restarted_total",
                "Epochs restarted after observing a higher term",
                &self.epochs_restarted_total,
            ),
            (
                "walprop_reconnect_attempts_total",
                "Connection attempts to acceptors",
                &self.reconnect_attempts_total,
            ),
            (
                "walprop_connection_resets_total",
                "Acceptor connections reset after a failure",
                &self.connection_resets_total,
            ),
            (
                "walprop_append_requests_sent_total",
                "Append requests sent",
                &self.append_requests_sent_total,
            ),
            ("walprop_wal_bytes_sent_total", "WAL bytes sent", &self.wal_bytes_sent_total),
            (
                "walprop_append_responses_received_total",
                "Append responses received",
                &self.append_responses_received_total,
            ),
        ];
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }

        output.push_str(
            "# HELP walprop_election_latency_ms Election latency histogram\n\
             # TYPE walprop_election_latency_ms histogram\n",
        );
        let mut cumulative = 0u64;
        for (i, &bound) in ELECTION_BUCKETS_MS.iter().enumerate() {
            cumulative += self.election_latency_buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "walprop_election_latency_ms_bucket{{le=\"{bound}\"}} {cumulative}",
            );
        }
        let count = self.election_latency_count.load(Ordering::Relaxed);
        let _ = write!(
            output,
            "walprop_election_latency_ms_bucket{{le=\"+Inf\"}} {count}\n\
             walprop_election_latency_ms_sum {}\n\
             walprop_election_latency_ms_count {count}\n",
            self.election_latency_sum_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        );

        let gauges = [
            ("walprop_current_term", "Current proposer term", &self.current_term),
            ("walprop_commit_lsn", "Quorum commit LSN", &self.commit_lsn),
            ("walprop_truncate_lsn", "LSN acceptors may truncate up to", &self.truncate_lsn),
            ("walprop_active_peers", "Acceptors streaming WAL", &self.active_peers),
        ];
        for (name, help, value) in gauges {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }

        output
    }

    /// Returns snapshot of the main metrics for testing/debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elections_won_total: self.elections_won_total.load(Ordering::Relaxed),
            epochs_restarted_total: self.epochs_restarted_total.load(Ordering::Relaxed),
            connection_resets_total: self.connection_resets_total.load(Ordering::Relaxed),
            append_requests_sent_total: self.append_requests_sent_total.load(Ordering::Relaxed),
            current_term: self.current_term.load(Ordering::Relaxed),
            commit_lsn: self.commit_lsn.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub elections_won_total: u64,
    pub epochs_restarted_total: u64,
    pub connection_resets_total: u64,
    pub append_requests_sent_total: u64,
    pub current_term: u64,
    pub commit_lsn: u64,
}
