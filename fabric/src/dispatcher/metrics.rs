use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dropped {
    pub reason: String,
}

impl Dropped {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Counters shared by every dispatcher created for a simulator (they survive reloads).
#[derive(Clone, Default)]
pub struct Metrics {
    pub dispatched: Counter,
    pub delivered: Counter,
    pub dropped: Family<Dropped, Counter>,
}

impl Metrics {
    /// Create the counters and register them with `registry`.
    pub fn new(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self::default();
        let mut registry = registry.lock().unwrap();
        registry.register(
            "mads_dispatched",
            "MADs submitted for delivery",
            metrics.dispatched.clone(),
        );
        registry.register(
            "mads_delivered",
            "MADs delivered to a node",
            metrics.delivered.clone(),
        );
        registry.register(
            "mads_dropped",
            "MADs dropped before delivery",
            metrics.dropped.clone(),
        );
        metrics
    }

    pub(crate) fn record_drop(&self, reason: &str) {
        self.dropped.get_or_create(&Dropped::new(reason)).inc();
    }
}
