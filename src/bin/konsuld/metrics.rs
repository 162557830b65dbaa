//! The `prometheus-client`-backed [`MetricsSink`]: a registry wired at
//! startup, with every metric family registered once. The core crates never
//! touch a registry directly -- they call through `MetricsSink`, so this is
//! the only place in the whole workspace that names a Prometheus type.
//!
//! Label sets vary per metric family (a command type here, a resource/
//! capability/result triple there), so each family is keyed by a plain
//! `Vec<(String, String)>` rather than a derived struct -- the dynamic-label
//! pattern `prometheus-client` itself documents for call sites that don't
//! know their label shape at compile time.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::LabelSetEncoder;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use konsul_store_api::MetricsSink;

/// A dynamic label set: `Vec<(String, String)>` already implements
/// `EncodeLabelSet`, but each metric family still needs its own named
/// newtype so the labels carried by one call to `incr_counter` can't be
/// accidentally mixed into another family's map key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Labels(Vec<(String, String)>);

impl EncodeLabelSet for Labels {
    fn encode(&self, encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        self.0.encode(encoder)
    }
}

fn labels(pairs: &[(&'static str, &str)]) -> Labels {
    Labels(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

/// One `Family` per named metric. Gauges/counters/histograms are separated
/// into their own maps because a Prometheus metric has one fixed type for
/// its lifetime.
pub struct PrometheusMetrics {
    counters: std::collections::HashMap<&'static str, Family<Labels, Counter>>,
    gauges: std::collections::HashMap<&'static str, Family<Labels, Gauge>>,
    histograms: std::collections::HashMap<&'static str, Family<Labels, Histogram>>,
}

const COUNTER_NAMES: &[(&str, &str)] = &[
    ("raft_apply_total", "raft log entries applied to the state machine"),
    ("raft_apply_errors_total", "raft log entries that failed to apply"),
    ("raft_leader_changes_total", "transitions into or out of the leader role"),
    ("raft_snapshot_total", "snapshots built by this node"),
    ("watch_events_total", "watch events emitted by the stores"),
    ("watch_events_dropped", "watch events dropped because a subscriber's queue was full"),
    ("acl_evaluations_total", "acl policy evaluations performed"),
];

const GAUGE_NAMES: &[(&str, &str)] = &[
    ("raft_state", "current raft server state, one gauge series per state label"),
    ("raft_is_leader", "1 if this node currently believes itself to be leader"),
    ("raft_peers_total", "number of peers in the current membership"),
    ("raft_last_index", "last log index on this node"),
    ("raft_commit_index", "last committed log index on this node"),
    ("raft_applied_index", "last log index applied to the state machine"),
    ("raft_replication_lag", "last_index minus applied_index"),
    ("watchers_active", "currently registered watch subscriptions"),
];

const HISTOGRAM_NAMES: &[(&str, &str)] = &[
    ("raft_apply_duration_seconds", "time spent applying one committed command"),
    ("acl_evaluation_duration", "time spent evaluating one acl decision"),
];

impl PrometheusMetrics {
    /// Registers every counter/gauge/histogram family against a fresh
    /// `Registry` and returns both: the `Registry` itself is handed back
    /// only so an embedding deployment can wire a scrape endpoint later
    /// (exposing it over HTTP is an external-collaborator concern this
    /// crate does not implement).
    pub fn new() -> (Self, Registry) {
        let mut registry = Registry::default();
        let mut counters = std::collections::HashMap::new();
        let mut gauges = std::collections::HashMap::new();
        let mut histograms = std::collections::HashMap::new();

        for (name, help) in COUNTER_NAMES {
            let family = Family::<Labels, Counter>::default();
            registry.register(*name, *help, family.clone());
            counters.insert(*name, family);
        }
        for (name, help) in GAUGE_NAMES {
            let family = Family::<Labels, Gauge>::default();
            registry.register(*name, *help, family.clone());
            gauges.insert(*name, family);
        }
        for (name, help) in HISTOGRAM_NAMES {
            let family = Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter())
            });
            registry.register(*name, *help, family.clone());
            histograms.insert(*name, family);
        }

        (PrometheusMetrics { counters, gauges, histograms }, registry)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn incr_counter(&self, name: &'static str, labels_in: &[(&'static str, &str)]) {
        if let Some(family) = self.counters.get(name) {
            family.get_or_create(&labels(labels_in)).inc();
        }
    }

    fn set_gauge(&self, name: &'static str, labels_in: &[(&'static str, &str)], value: i64) {
        if let Some(family) = self.gauges.get(name) {
            family.get_or_create(&labels(labels_in)).set(value);
        }
    }

    fn observe_histogram(&self, name: &'static str, labels_in: &[(&'static str, &str)], value: f64) {
        if let Some(family) = self.histograms.get(name) {
            family.get_or_create(&labels(labels_in)).observe(value);
        }
    }
}
