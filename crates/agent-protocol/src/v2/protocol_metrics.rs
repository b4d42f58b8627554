//! Connection-level metrics for the v2 runtime.
//!
//! Tracks accept-loop and per-connection counters that sit alongside the
//! capability-reported [`crate::capability::MetricsReport`]: connections
//! accepted/rejected, active connection count, handshake failures, and
//! decision-serialization latency. Exposed to operators via
//! [`ConnectionMetrics::to_prometheus`] and folded into the capability's
//! own report via [`ConnectionMetrics::merge_into`].

use crate::capability::MetricsReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection-level metrics for one listener (UDS or TCP).
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Connections accepted.
    pub connections_accepted_total: AtomicU64,
    /// Connections rejected (over `max_connections`, or while draining).
    pub connections_rejected_total: AtomicU64,
    /// v2 handshakes that failed or timed out.
    pub handshake_failures_total: AtomicU64,
    /// Terminating codec errors (oversize frame, malformed JSON, EOF mid-frame).
    pub protocol_errors_total: AtomicU64,
    /// Request-lifecycle events dispatched to the capability.
    pub requests_total: AtomicU64,
    /// Decision replies written back to the peer.
    pub responses_total: AtomicU64,

    /// Currently open connections.
    pub active_connections: AtomicU64,

    /// Time spent serializing a `DecisionMessageV2` to JSON.
    pub decision_serialization_time: HistogramMetric,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_accepted(&self) {
        self.connections_accepted_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rejected(&self) {
        self.connections_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_handshake_failures(&self) {
        self.handshake_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_responses(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decision_serialization(&self, duration: Duration) {
        self.decision_serialization_time.record(duration);
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            connections_accepted_total: self.connections_accepted_total.load(Ordering::Relaxed),
            connections_rejected_total: self.connections_rejected_total.load(Ordering::Relaxed),
            handshake_failures_total: self.handshake_failures_total.load(Ordering::Relaxed),
            protocol_errors_total: self.protocol_errors_total.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            responses_total: self.responses_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            decision_serialization_time: self.decision_serialization_time.snapshot(),
        }
    }

    /// Fold these counters into a capability's [`MetricsReport`] under
    /// `custom`, and set the `active` gauge from `active_connections`.
    pub fn merge_into(&self, report: &mut MetricsReport) {
        let snap = self.snapshot();
        report.gauges.active = snap.active_connections;
        report
            .custom
            .insert("connections_accepted_total".to_string(), snap.connections_accepted_total as f64);
        report
            .custom
            .insert("connections_rejected_total".to_string(), snap.connections_rejected_total as f64);
        report
            .custom
            .insert("handshake_failures_total".to_string(), snap.handshake_failures_total as f64);
        report
            .custom
            .insert("protocol_errors_total".to_string(), snap.protocol_errors_total as f64);
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let snap = self.snapshot();
        let mut output = String::with_capacity(1024);

        output.push_str(&format!(
            "# HELP {prefix}_connections_accepted_total Connections accepted\n\
             # TYPE {prefix}_connections_accepted_total counter\n\
             {prefix}_connections_accepted_total {}\n\n",
            snap.connections_accepted_total
        ));

        output.push_str(&format!(
            "# HELP {prefix}_connections_rejected_total Connections rejected (capacity or draining)\n\
             # TYPE {prefix}_connections_rejected_total counter\n\
             {prefix}_connections_rejected_total {}\n\n",
            snap.connections_rejected_total
        ));

        output.push_str(&format!(
            "# HELP {prefix}_handshake_failures_total Failed or timed-out v2 handshakes\n\
             # TYPE {prefix}_handshake_failures_total counter\n\
             {prefix}_handshake_failures_total {}\n\n",
            snap.handshake_failures_total
        ));

        output.push_str(&format!(
            "# HELP {prefix}_protocol_errors_total Terminating codec errors\n\
             # TYPE {prefix}_protocol_errors_total counter\n\
             {prefix}_protocol_errors_total {}\n\n",
            snap.protocol_errors_total
        ));

        output.push_str(&format!(
            "# HELP {prefix}_active_connections Currently open connections\n\
             # TYPE {prefix}_active_connections gauge\n\
             {prefix}_active_connections {}\n\n",
            snap.active_connections
        ));

        output.push_str(&snap.decision_serialization_time.to_prometheus(
            &format!("{prefix}_decision_serialization_seconds"),
            "Time spent serializing a decision reply, in seconds",
        ));

        output
    }
}

/// Simple histogram metric using predefined buckets.
#[derive(Debug)]
pub struct HistogramMetric {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for HistogramMetric {
    fn default() -> Self {
        let buckets = vec![10, 50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000];
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl HistogramMetric {
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let bucket_idx = self.buckets.iter().position(|&b| micros <= b).unwrap_or(self.buckets.len());
        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            sum: self.sum.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
    pub sum: u64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn to_prometheus(&self, name: &str, help: &str) -> String {
        let mut output = String::with_capacity(512);
        output.push_str(&format!("# HELP {name} {help}\n"));
        output.push_str(&format!("# TYPE {name} histogram\n"));

        let mut cumulative = 0u64;
        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i];
            let le = boundary as f64 / 1_000_000.0;
            output.push_str(&format!("{name}_bucket{{le=\"{le:.6}\"}} {cumulative}\n"));
        }
        cumulative += self.counts.last().copied().unwrap_or(0);
        output.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {cumulative}\n"));

        let sum_seconds = self.sum as f64 / 1_000_000.0;
        output.push_str(&format!("{name}_sum {sum_seconds:.6}\n"));
        output.push_str(&format!("{name}_count {}\n\n", self.count));
        output
    }

    pub fn mean_micros(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMetricsSnapshot {
    pub connections_accepted_total: u64,
    pub connections_rejected_total: u64,
    pub handshake_failures_total: u64,
    pub protocol_errors_total: u64,
    pub requests_total: u64,
    pub responses_total: u64,
    pub active_connections: u64,
    pub decision_serialization_time: HistogramSnapshot,
}

/// Measures and records a decision-serialization duration on drop-free completion.
pub struct DurationRecorder<'a> {
    histogram: &'a HistogramMetric,
    start: Instant,
}

impl<'a> DurationRecorder<'a> {
    pub fn new(histogram: &'a HistogramMetric) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }

    pub fn record(self) {
        self.histogram.record(self.start.elapsed());
    }
}
