//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the upload core reports into.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    enqueues_accepted_total: IntCounter,
    enqueues_rejected_total: IntCounterVec,
    governor_bytes_attempted_total: IntCounter,
    governor_bytes_granted_total: IntCounter,
    governor_bytes_returned_total: IntCounter,
    uploads_completed_total: IntCounterVec,
    queue_depth: IntGauge,
    active_uploads: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Uploads currently waiting for or holding a slot.
    pub queue_depth: i64,
    /// Uploads currently moving bytes.
    pub active_uploads: i64,
    /// Total accepted enqueue requests.
    pub enqueues_accepted_total: u64,
    /// Total bytes granted by the governor.
    pub governor_bytes_granted_total: u64,
    /// Total bytes refunded to the governor.
    pub governor_bytes_returned_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let enqueues_accepted_total = IntCounter::with_opts(Opts::new(
            "enqueues_accepted_total",
            "Upload requests accepted at admission",
        ))?;
        let enqueues_rejected_total = IntCounterVec::new(
            Opts::new(
                "enqueues_rejected_total",
                "Upload requests rejected at admission, by reason",
            ),
            &["reason"],
        )?;
        let governor_bytes_attempted_total = IntCounter::with_opts(Opts::new(
            "governor_bytes_attempted_total",
            "Bytes requested from the governor",
        ))?;
        let governor_bytes_granted_total = IntCounter::with_opts(Opts::new(
            "governor_bytes_granted_total",
            "Bytes granted by the governor",
        ))?;
        let governor_bytes_returned_total = IntCounter::with_opts(Opts::new(
            "governor_bytes_returned_total",
            "Unused bytes refunded to the governor",
        ))?;
        let uploads_completed_total = IntCounterVec::new(
            Opts::new(
                "uploads_completed_total",
                "Uploads reaching a terminal state, by outcome",
            ),
            &["outcome"],
        )?;
        let queue_depth = IntGauge::with_opts(Opts::new(
            "queue_depth",
            "Uploads waiting for or holding a slot",
        ))?;
        let active_uploads =
            IntGauge::with_opts(Opts::new("active_uploads", "Uploads moving bytes"))?;

        registry.register(Box::new(enqueues_accepted_total.clone()))?;
        registry.register(Box::new(enqueues_rejected_total.clone()))?;
        registry.register(Box::new(governor_bytes_attempted_total.clone()))?;
        registry.register(Box::new(governor_bytes_granted_total.clone()))?;
        registry.register(Box::new(governor_bytes_returned_total.clone()))?;
        registry.register(Box::new(uploads_completed_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_uploads.clone()))?;

        Ok(Self {
            inner: std::sync::Arc::new(MetricsInner {
                registry,
                enqueues_accepted_total,
                enqueues_rejected_total,
                governor_bytes_attempted_total,
                governor_bytes_granted_total,
                governor_bytes_returned_total,
                uploads_completed_total,
                queue_depth,
                active_uploads,
            }),
        })
    }

    /// Record an accepted enqueue.
    pub fn record_enqueue_accepted(&self) {
        self.inner.enqueues_accepted_total.inc();
    }

    /// Record a rejected enqueue under a reason label.
    pub fn record_enqueue_rejected(&self, reason: &str) {
        self.inner
            .enqueues_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record one governor acquire: what was asked for and what was granted.
    pub fn record_governor_grant(&self, attempted: u64, granted: u64) {
        self.inner.governor_bytes_attempted_total.inc_by(attempted);
        self.inner.governor_bytes_granted_total.inc_by(granted);
    }

    /// Record a governor refund.
    pub fn record_governor_return(&self, returned: u64) {
        self.inner.governor_bytes_returned_total.inc_by(returned);
    }

    /// Record a terminal upload under its outcome label.
    pub fn record_upload_completed(&self, outcome: &str) {
        self.inner
            .uploads_completed_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Adjust the queue depth gauge.
    pub fn set_queue_depth(&self, depth: i64) {
        self.inner.queue_depth.set(depth);
    }

    /// Adjust the active uploads gauge.
    pub fn set_active_uploads(&self, count: i64) {
        self.inner.active_uploads.set(count);
    }

    /// Capture the current values of the health-relevant collectors.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.inner.queue_depth.get(),
            active_uploads: self.inner.active_uploads.get(),
            enqueues_accepted_total: self.inner.enqueues_accepted_total.get(),
            governor_bytes_granted_total: self.inner.governor_bytes_granted_total.get(),
            governor_bytes_returned_total: self.inner.governor_bytes_returned_total.get(),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
