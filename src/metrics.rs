// =============================================================================
// Prometheus metrics + per-order latency tracker
// =============================================================================
//
// All metrics carry the `executor_` prefix and register against a private
// registry rendered by the /metrics endpoint. The LatencyTracker stamps the
// hot path of a single order (signal received → quote → sign → submit →
// confirm) and feeds the histograms as each mark is reached.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use prometheus::{Counter, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Millisecond buckets for the wider hot-path / quote histograms.
const PATH_BUCKETS: &[f64] = &[
    5.0, 10.0, 20.0, 50.0, 75.0, 100.0, 150.0, 200.0, 300.0, 500.0, 1000.0,
];

/// Millisecond buckets for the tight sign/submit histograms.
const STEP_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 75.0, 100.0, 150.0, 200.0];

/// Millisecond buckets for confirmation latency.
const CONFIRM_BUCKETS: &[f64] = &[
    100.0, 200.0, 300.0, 500.0, 800.0, 1200.0, 2000.0, 3000.0, 5000.0, 10000.0,
];

/// Registry-backed metrics for the executor.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    /// End-to-end latency from signal receipt to tx submit (ms).
    pub hot_path_ms: Histogram,
    /// Quote request → response (ms).
    pub quote_ms: Histogram,
    /// Quote received → signed (ms).
    pub sign_ms: Histogram,
    /// Signed → submitted (ms).
    pub submit_ms: Histogram,
    /// Submitted → confirmed (ms).
    pub confirm_ms: Histogram,

    pub orders_started: Counter,
    pub orders_confirmed: Counter,
    pub orders_failed: Counter,
    /// Orders aborted at the pre-submit gate for exceeding the hot-path budget.
    pub orders_aborted_latency: Counter,

    pub trades_total: Counter,
    pub trades_won: Counter,

    pub bundle_success: Counter,
    pub bundle_fallback: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let histogram = |name: &str, help: &str, buckets: &[f64]| -> Result<Histogram> {
            let h = Histogram::with_opts(
                HistogramOpts::new(name, help).buckets(buckets.to_vec()),
            )?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };
        let counter = |name: &str, help: &str| -> Result<Counter> {
            let c = Counter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let hot_path_ms = histogram(
            "executor_hot_path_ms",
            "End-to-end latency from signal to tx submit (ms)",
            PATH_BUCKETS,
        )?;
        let quote_ms = histogram(
            "executor_quote_latency_ms",
            "Latency from quote request to response (ms)",
            PATH_BUCKETS,
        )?;
        let sign_ms = histogram(
            "executor_sign_latency_ms",
            "Latency to sign the transaction (ms)",
            STEP_BUCKETS,
        )?;
        let submit_ms = histogram(
            "executor_submit_latency_ms",
            "Latency from sign to RPC submit (ms)",
            STEP_BUCKETS,
        )?;
        let confirm_ms = histogram(
            "executor_confirm_latency_ms",
            "Latency from submit to confirmation (ms)",
            CONFIRM_BUCKETS,
        )?;

        let orders_started = counter("executor_orders_started_total", "Orders started")?;
        let orders_confirmed = counter("executor_orders_confirmed_total", "Orders confirmed")?;
        let orders_failed = counter("executor_orders_failed_total", "Orders failed")?;
        let orders_aborted_latency = counter(
            "executor_orders_aborted_latency_total",
            "Orders aborted because the hot path exceeded its budget",
        )?;

        let trades_total = counter("executor_trades_total", "Trades reaching a terminal state")?;
        let trades_won = counter("executor_trades_won_total", "Winning trades (pnl > 0)")?;

        let bundle_success = counter(
            "executor_bundle_success_total",
            "Successful bundle endpoint sends",
        )?;
        let bundle_fallback = counter(
            "executor_bundle_fallback_total",
            "Bundle sends that failed and fell back to the normal submit",
        )?;

        Ok(Self {
            registry: Arc::new(registry),
            hot_path_ms,
            quote_ms,
            sign_ms,
            submit_ms,
            confirm_ms,
            orders_started,
            orders_confirmed,
            orders_failed,
            orders_aborted_latency,
            trades_total,
            trades_won,
            bundle_success,
            bundle_fallback,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Latency tracker
// ---------------------------------------------------------------------------

/// High-resolution tracker for a single order's hot path.
///
/// Construction stamps the signal-received instant; each `mark_*` observes
/// the corresponding histogram. Monotonic clock throughout.
pub struct LatencyTracker {
    metrics: Arc<Metrics>,
    received_at: Instant,
    quote_requested_at: Option<Instant>,
    quote_received_at: Option<Instant>,
    signed_at: Option<Instant>,
    submitted_at: Option<Instant>,
}

impl LatencyTracker {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            received_at: Instant::now(),
            quote_requested_at: None,
            quote_received_at: None,
            signed_at: None,
            submitted_at: None,
        }
    }

    fn ms_between(from: Instant, to: Instant) -> f64 {
        to.duration_since(from).as_secs_f64() * 1000.0
    }

    pub fn mark_quote_requested(&mut self) {
        self.quote_requested_at = Some(Instant::now());
    }

    pub fn mark_quote_received(&mut self) {
        let now = Instant::now();
        self.quote_received_at = Some(now);
        if let Some(req) = self.quote_requested_at {
            self.metrics.quote_ms.observe(Self::ms_between(req, now));
        }
    }

    pub fn mark_signed(&mut self) {
        let now = Instant::now();
        self.signed_at = Some(now);
        if let Some(q) = self.quote_received_at {
            self.metrics.sign_ms.observe(Self::ms_between(q, now));
        }
    }

    pub fn mark_submitted(&mut self) {
        let now = Instant::now();
        self.submitted_at = Some(now);
        if let Some(s) = self.signed_at {
            self.metrics.submit_ms.observe(Self::ms_between(s, now));
        }
        self.metrics
            .hot_path_ms
            .observe(Self::ms_between(self.received_at, now));
    }

    pub fn mark_confirmed(&self) {
        if let Some(sub) = self.submitted_at {
            self.metrics
                .confirm_ms
                .observe(Self::ms_between(sub, Instant::now()));
        }
    }

    /// Milliseconds elapsed on the hot path so far; compared against the
    /// budget at the pre-submit gate.
    pub fn hot_path_ms_so_far(&self) -> f64 {
        Self::ms_between(self.received_at, Instant::now())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_all_metric_families() {
        let m = Metrics::new().unwrap();
        m.orders_started.inc();
        m.hot_path_ms.observe(42.0);
        let text = m.render();
        assert!(text.contains("executor_orders_started_total"));
        assert!(text.contains("executor_hot_path_ms"));
        assert!(text.contains("executor_orders_aborted_latency_total"));
        assert!(text.contains("executor_trades_won_total"));
    }

    #[test]
    fn tracker_marks_feed_histograms() {
        let m = Arc::new(Metrics::new().unwrap());
        let mut t = LatencyTracker::new(m.clone());
        t.mark_quote_requested();
        t.mark_quote_received();
        t.mark_signed();
        t.mark_submitted();
        t.mark_confirmed();

        assert!(t.hot_path_ms_so_far() >= 0.0);
        let text = m.render();
        // One observation each.
        assert!(text.contains("executor_quote_latency_ms_count 1"));
        assert!(text.contains("executor_hot_path_ms_count 1"));
        assert!(text.contains("executor_confirm_latency_ms_count 1"));
    }
}
