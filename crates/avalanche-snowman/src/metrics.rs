//! Prometheus-style metrics for the consensus engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Counter metric, optionally partitioned by labels.
pub struct Counter {
    name: String,
    help: String,
    label_names: Vec<String>,
    values: RwLock<HashMap<Vec<String>, u64>>,
}

impl Counter {
    fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Increments the unlabeled counter.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increments the unlabeled counter by a value.
    pub fn inc_by(&self, v: u64) {
        self.inc_by_with(&[], v);
    }

    /// Increments the series with the given label values.
    pub fn inc_with(&self, labels: &[&str]) {
        self.inc_by_with(labels, 1);
    }

    /// Increments the series with the given label values by a value.
    pub fn inc_by_with(&self, labels: &[&str], v: u64) {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        *self.values.write().entry(key).or_insert(0) += v;
    }

    /// Gets the unlabeled value.
    pub fn get(&self) -> u64 {
        self.get_with(&[])
    }

    /// Gets the value of the series with the given label values.
    pub fn get_with(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.values.read().get(&key).copied().unwrap_or(0)
    }
}

/// Gauge metric.
pub struct Gauge {
    name: String,
    help: String,
    value: RwLock<f64>,
}

impl Gauge {
    fn new(name: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            value: RwLock::new(0.0),
        }
    }

    /// Sets the gauge value.
    pub fn set(&self, v: f64) {
        *self.value.write() = v;
    }

    /// Adds to the gauge.
    pub fn add(&self, v: f64) {
        *self.value.write() += v;
    }

    /// Increments the gauge.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Decrements the gauge.
    pub fn dec(&self) {
        self.add(-1.0);
    }

    /// Gets the current value.
    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

/// Histogram metric.
pub struct Histogram {
    name: String,
    help: String,
    buckets: Vec<f64>,
    data: RwLock<HistogramData>,
}

#[derive(Default)]
struct HistogramData {
    count: u64,
    sum: f64,
    bucket_counts: Vec<u64>,
}

impl Histogram {
    fn new(name: &str, help: &str, buckets: Vec<f64>) -> Self {
        let bucket_counts = vec![0; buckets.len()];
        Self {
            name: name.to_string(),
            help: help.to_string(),
            buckets,
            data: RwLock::new(HistogramData {
                count: 0,
                sum: 0.0,
                bucket_counts,
            }),
        }
    }

    /// Observes a value.
    pub fn observe(&self, v: f64) {
        let mut data = self.data.write();
        data.count += 1;
        data.sum += v;
        for (i, &bucket) in self.buckets.iter().enumerate() {
            if v <= bucket {
                data.bucket_counts[i] += 1;
            }
        }
    }

    /// Returns the number of observations.
    pub fn count(&self) -> u64 {
        self.data.read().count
    }

    /// Returns the sum of observations.
    pub fn sum(&self) -> f64 {
        self.data.read().sum
    }
}

/// Metric registry.
pub struct Registry {
    prefix: String,
    counters: RwLock<Vec<Arc<Counter>>>,
    gauges: RwLock<Vec<Arc<Gauge>>>,
    histograms: RwLock<Vec<Arc<Histogram>>>,
}

impl Registry {
    /// Creates a new registry. Metric names are prefixed with `prefix_`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counters: RwLock::new(Vec::new()),
            gauges: RwLock::new(Vec::new()),
            histograms: RwLock::new(Vec::new()),
        }
    }

    /// Registers an unlabeled counter.
    pub fn register_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        self.register_counter_vec(name, help, &[])
    }

    /// Registers a counter partitioned by the given label names.
    pub fn register_counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> Arc<Counter> {
        let counter = Arc::new(Counter::new(
            &format!("{}_{}", self.prefix, name),
            help,
            labels,
        ));
        self.counters.write().push(counter.clone());
        counter
    }

    /// Registers a gauge.
    pub fn register_gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::new(&format!("{}_{}", self.prefix, name), help));
        self.gauges.write().push(gauge.clone());
        gauge
    }

    /// Registers a histogram with the given bucket bounds.
    pub fn register_histogram(&self, name: &str, help: &str, buckets: Vec<f64>) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(
            &format!("{}_{}", self.prefix, name),
            help,
            buckets,
        ));
        self.histograms.write().push(histogram.clone());
        histogram
    }

    /// Exports all metrics in the Prometheus text format.
    pub fn export(&self) -> String {
        let mut output = String::new();

        for counter in self.counters.read().iter() {
            output.push_str(&format!("# HELP {} {}\n", counter.name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", counter.name));
            let values = counter.values.read();
            if values.is_empty() {
                output.push_str(&format!("{} 0\n", counter.name));
                continue;
            }
            for (label_values, value) in values.iter() {
                if label_values.is_empty() {
                    output.push_str(&format!("{} {}\n", counter.name, value));
                } else {
                    let labels = counter
                        .label_names
                        .iter()
                        .zip(label_values.iter())
                        .map(|(name, value)| format!("{name}=\"{value}\""))
                        .collect::<Vec<_>>()
                        .join(",");
                    output.push_str(&format!("{}{{{}}} {}\n", counter.name, labels, value));
                }
            }
        }

        for gauge in self.gauges.read().iter() {
            output.push_str(&format!("# HELP {} {}\n", gauge.name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", gauge.name));
            output.push_str(&format!("{} {}\n", gauge.name, gauge.get()));
        }

        for histogram in self.histograms.read().iter() {
            output.push_str(&format!("# HELP {} {}\n", histogram.name, histogram.help));
            output.push_str(&format!("# TYPE {} histogram\n", histogram.name));
            let data = histogram.data.read();
            let mut cumulative = 0u64;
            for (bucket, count) in histogram.buckets.iter().zip(data.bucket_counts.iter()) {
                cumulative += count;
                output.push_str(&format!(
                    "{}_bucket{{le=\"{}\"}} {}\n",
                    histogram.name, bucket, cumulative
                ));
            }
            output.push_str(&format!(
                "{}_bucket{{le=\"+Inf\"}} {}\n",
                histogram.name, data.count
            ));
            output.push_str(&format!("{}_sum {}\n", histogram.name, data.sum));
            output.push_str(&format!("{}_count {}\n", histogram.name, data.count));
        }

        output
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new("avalanche")
    }
}

/// Where a block entering consensus came from, used as the `source` label of
/// the issued counter and remembered per outstanding fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSource {
    /// Fetched because a peer's chits named it
    PullGossip,
    /// Pushed by a peer's query
    PushGossip,
    /// Built by the local VM
    Built,
}

impl IssueSource {
    /// The label value recorded for this source.
    pub fn label(&self) -> &'static str {
        match self {
            IssueSource::PullGossip => "pull",
            IssueSource::PushGossip => "push",
            IssueSource::Built => "built",
        }
    }
}

/// Result labels for processing-ancestor lookups.
pub const ANCESTOR_RESULT: &str = "ancestor";
/// The vote already named a processing block.
pub const SELF_RESULT: &str = "self";
/// The walk hit a block that couldn't be fetched.
pub const MISSING_RESULT: &str = "missing";
/// The walk descended below the accepted frontier.
pub const DECIDED_RESULT: &str = "decided";

/// The engine's metric surface.
pub struct EngineMetrics {
    /// Blocks issued to consensus, by source
    pub issued: Arc<Counter>,
    /// Bytes of Put messages that carried nothing usable
    pub num_useless_put_bytes: Arc<Counter>,
    /// Bytes of PushQuery messages that carried nothing usable
    pub num_useless_push_query_bytes: Arc<Counter>,
    /// Successful BuildBlock calls
    pub num_builds: Arc<Counter>,
    /// Failed BuildBlock calls
    pub num_builds_failed: Arc<Counter>,
    /// Accepted-height lookups the VM could not answer
    pub num_missing_accepted_blocks: Arc<Counter>,
    /// Outcomes of processing-ancestor lookups, by result
    pub num_get_processing_ancestor_results: Arc<Counter>,
    /// Outstanding block fetches
    pub num_requests: Arc<Gauge>,
    /// Blocks pending missing ancestors
    pub num_pending: Arc<Gauge>,
    /// Block ids with jobs blocked on them
    pub num_blocked: Arc<Gauge>,
    /// Blocks in the non-verified forest
    pub num_non_verifieds: Arc<Gauge>,
    /// 1 once the engine has entered normal operation
    pub bootstrap_finished: Arc<Gauge>,
    /// Stake weight of peers whose blocks were issued
    pub issuer_stake: Arc<Histogram>,
}

impl EngineMetrics {
    /// Registers the engine metrics on `registry`.
    pub fn new(registry: &Registry) -> Self {
        Self {
            issued: registry.register_counter_vec(
                "blks_issued",
                "Blocks issued to consensus, by source",
                &["source"],
            ),
            num_useless_put_bytes: registry.register_counter(
                "num_useless_put_bytes",
                "Put bytes that were not useful",
            ),
            num_useless_push_query_bytes: registry.register_counter(
                "num_useless_push_query_bytes",
                "PushQuery bytes that were not useful",
            ),
            num_builds: registry.register_counter("blks_built", "Blocks built by the VM"),
            num_builds_failed: registry
                .register_counter("blk_builds_failed", "BuildBlock calls that failed"),
            num_missing_accepted_blocks: registry.register_counter(
                "num_missing_accepted_blocks",
                "Accepted-height lookups the VM could not answer",
            ),
            num_get_processing_ancestor_results: registry.register_counter_vec(
                "get_processing_ancestor_results",
                "Outcomes of processing-ancestor lookups",
                &["result"],
            ),
            num_requests: registry.register_gauge("requests", "Outstanding block fetches"),
            num_pending: registry.register_gauge("pending", "Blocks pending missing ancestors"),
            num_blocked: registry.register_gauge("blocked", "Block ids with jobs blocked on them"),
            num_non_verifieds: registry
                .register_gauge("non_verified_blks", "Blocks in the non-verified forest"),
            bootstrap_finished: registry.register_gauge(
                "bootstrap_finished",
                "Whether the engine has entered normal operation",
            ),
            issuer_stake: registry.register_histogram(
                "issuer_stake",
                "Stake weight of peers whose blocks were issued",
                vec![1.0, 1e3, 1e6, 1e9, 1e12, 1e15, 1e18],
            ),
        }
    }
}
