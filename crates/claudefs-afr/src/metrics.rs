//! Transaction engine metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic total.
    Counter,
    /// Current level.
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// One engine metric, labelled by volume when written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    /// Metric name, e.g. `claudefs_afr_txn_started_total`.
    pub name: &'static str,
    /// HELP text.
    pub help: &'static str,
    /// Counter or gauge.
    pub kind: MetricKind,
    /// Current value.
    pub value: u64,
}

impl Metric {
    fn counter(name: &'static str, help: &'static str, value: u64) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            value,
        }
    }

    /// Appends the HELP, TYPE and sample lines for `volume` to `out`.
    pub fn write_to(&self, volume: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind.as_str());
        let _ = writeln!(out, "{}{{volume=\"{}\"}} {}", self.name, volume, self.value);
    }
}

/// Live counters of one transaction engine.
#[derive(Debug, Default)]
pub struct AfrMetrics {
    started: AtomicU64,
    full_success: AtomicU64,
    partial_success: AtomicU64,
    failed: AtomicU64,
    lock_failures: AtomicU64,
    preop_downgrades: AtomicU64,
    postop_write_failures: AtomicU64,
    heal_notifications: AtomicU64,
    cancellations: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of `AfrMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AfrMetricsSnapshot {
    /// Transactions started.
    pub started: u64,
    /// Transactions that succeeded on every up replica.
    pub full_success: u64,
    /// Transactions that met quorum with lagging replicas.
    pub partial_success: u64,
    /// Transactions that failed.
    pub failed: u64,
    /// Lock acquisitions that failed.
    pub lock_failures: u64,
    /// Replicas dropped because their pre-op mark did not persist.
    pub preop_downgrades: u64,
    /// Post-op changelog writes that failed.
    pub postop_write_failures: u64,
    /// Heal requests emitted.
    pub heal_notifications: u64,
    /// Transactions stopped by cancellation.
    pub cancellations: u64,
    /// Transactions currently running.
    pub in_flight: u64,
}

impl AfrMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn txn_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn txn_full_success(&self) {
        self.full_success.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn txn_partial_success(&self) {
        self.partial_success.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn txn_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn lock_failure(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn preop_downgrade(&self, count: u64) {
        self.preop_downgrades.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn postop_write_failure(&self, count: u64) {
        self.postop_write_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn heal_notifications(&self, count: u64) {
        self.heal_notifications.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> AfrMetricsSnapshot {
        AfrMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            full_success: self.full_success.load(Ordering::Relaxed),
            partial_success: self.partial_success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            preop_downgrades: self.preop_downgrades.load(Ordering::Relaxed),
            postop_write_failures: self.postop_write_failures.load(Ordering::Relaxed),
            heal_notifications: self.heal_notifications.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl AfrMetricsSnapshot {
    /// Every metric with its current value.
    pub fn to_metrics(&self) -> Vec<Metric> {
        vec![
            Metric::counter("claudefs_afr_txn_started_total", "Transactions started", self.started),
            Metric::counter(
                "claudefs_afr_txn_full_success_total",
                "Transactions applied on every up replica",
                self.full_success,
            ),
            Metric::counter(
                "claudefs_afr_txn_partial_success_total",
                "Transactions that met quorum with lagging replicas",
                self.partial_success,
            ),
            Metric::counter("claudefs_afr_txn_failed_total", "Transactions that failed", self.failed),
            Metric::counter(
                "claudefs_afr_lock_failures_total",
                "Lock acquisitions that failed",
                self.lock_failures,
            ),
            Metric::counter(
                "claudefs_afr_preop_downgrades_total",
                "Replicas dropped after a failed pre-op mark",
                self.preop_downgrades,
            ),
            Metric::counter(
                "claudefs_afr_postop_write_failures_total",
                "Post-op changelog writes that failed",
                self.postop_write_failures,
            ),
            Metric::counter(
                "claudefs_afr_heal_notifications_total",
                "Self-heal requests emitted",
                self.heal_notifications,
            ),
            Metric::counter(
                "claudefs_afr_cancellations_total",
                "Transactions stopped by cancellation",
                self.cancellations,
            ),
            Metric {
                name: "claudefs_afr_txn_in_flight",
                help: "Transactions currently running",
                kind: MetricKind::Gauge,
                value: self.in_flight,
            },
        ]
    }

    /// Formats all metrics of `volume` as Prometheus text.
    pub fn format_prometheus(&self, volume: &str) -> String {
        let mut out = String::new();
        for metric in self.to_metrics() {
            metric.write_to(volume, &mut out);
        }
        out
    }

    /// Fraction of finished transactions that failed, 0.0 when none finished.
    pub fn failure_rate(&self) -> f64 {
        let finished = self.full_success + self.partial_success + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.failed as f64 / finished as f64
    }
}
