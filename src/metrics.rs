use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub action: String,
    pub outcome: Decision,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Decision {
    Allow,
    Deny,
    /// The policy store failed; the request was refused.
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the knot.
pub struct Metrics {
    // -- authorization --
    pub authz_decisions: Family<DecisionLabels, Counter>,
    pub signature_rejections: Counter,

    // -- event stream --
    pub firehose_events: Family<EventLabels, Counter>,
    pub firehose_reconnects: Counter,
    pub firehose_cursor: Gauge,
}

impl Metrics {
    /// Create all metrics and register them with the given `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let authz_decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "knot_authz_decisions",
            "Authorization decisions by action and outcome",
            authz_decisions.clone(),
        );

        let signature_rejections = Counter::default();
        registry.register(
            "knot_signature_rejections",
            "Internal API requests refused for a missing or bad signature",
            signature_rejections.clone(),
        );

        let firehose_events = Family::<EventLabels, Counter>::default();
        registry.register(
            "knot_firehose_events",
            "Event stream messages by outcome",
            firehose_events.clone(),
        );

        let firehose_reconnects = Counter::default();
        registry.register(
            "knot_firehose_reconnects",
            "Event stream reconnections",
            firehose_reconnects.clone(),
        );

        let firehose_cursor: Gauge = Gauge::default();
        registry.register(
            "knot_firehose_cursor_us",
            "Persisted event stream cursor in microseconds",
            firehose_cursor.clone(),
        );

        Self {
            authz_decisions,
            signature_rejections,
            firehose_events,
            firehose_reconnects,
            firehose_cursor,
        }
    }

    pub fn record_decision(&self, action: &str, outcome: Decision) {
        self.authz_decisions
            .get_or_create(&DecisionLabels {
                action: action.to_string(),
                outcome,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all knot metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
