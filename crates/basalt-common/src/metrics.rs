use std::sync::{Arc, OnceLock};

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide server metrics.
///
/// Cloning is cheap; all clones share one prometheus registry.
#[derive(Clone, Debug)]
pub struct ServerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    request_deserialization_exceptions: Counter,
    response_serialization_exceptions: Counter,
    uncaught_exceptions: Counter,
    queries: CounterVec,
    missing_segments: CounterVec,
    scheduling_timeout_exceptions: CounterVec,
    query_execution_exceptions: CounterVec,
    groups_limit_drops: CounterVec,
    query_processing_seconds: HistogramVec,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_request_deserialization_exceptions(&self) {
        self.inner.request_deserialization_exceptions.inc();
    }

    pub fn inc_response_serialization_exceptions(&self) {
        self.inner.response_serialization_exceptions.inc();
    }

    pub fn inc_uncaught_exceptions(&self) {
        self.inner.uncaught_exceptions.inc();
    }

    pub fn inc_queries(&self, table: &str) {
        self.inner.queries.with_label_values(&[table]).inc();
    }

    pub fn add_missing_segments(&self, table: &str, count: u64) {
        self.inner
            .missing_segments
            .with_label_values(&[table])
            .inc_by(count as f64);
    }

    pub fn inc_scheduling_timeout_exceptions(&self, table: &str) {
        self.inner
            .scheduling_timeout_exceptions
            .with_label_values(&[table])
            .inc();
    }

    pub fn inc_query_execution_exceptions(&self, table: &str) {
        self.inner
            .query_execution_exceptions
            .with_label_values(&[table])
            .inc();
    }

    pub fn add_groups_limit_drops(&self, table: &str, count: u64) {
        self.inner
            .groups_limit_drops
            .with_label_values(&[table])
            .inc_by(count as f64);
    }

    pub fn observe_query_processing(&self, table: &str, secs: f64) {
        self.inner
            .query_processing_seconds
            .with_label_values(&[table])
            .observe(secs.max(0.0));
    }

    /// Renders all registered families in prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let request_deserialization_exceptions = counter(
            &registry,
            "basalt_request_deserialization_exceptions_total",
            "Requests that failed to decode",
        );
        let response_serialization_exceptions = counter(
            &registry,
            "basalt_response_serialization_exceptions_total",
            "Responses that failed to encode",
        );
        let uncaught_exceptions = counter(
            &registry,
            "basalt_uncaught_exceptions_total",
            "Unexpected errors outside the query pipeline",
        );
        let queries = counter_vec(
            &registry,
            "basalt_queries_total",
            "Queries processed per table",
            &["table"],
        );
        let missing_segments = counter_vec(
            &registry,
            "basalt_missing_segments_total",
            "Requested segments not resident at acquire time",
            &["table"],
        );
        let scheduling_timeout_exceptions = counter_vec(
            &registry,
            "basalt_scheduling_timeout_exceptions_total",
            "Queries rejected because scheduler wait exceeded the timeout",
            &["table"],
        );
        let query_execution_exceptions = counter_vec(
            &registry,
            "basalt_query_execution_exceptions_total",
            "Queries that failed during plan execution",
            &["table"],
        );
        let groups_limit_drops = counter_vec(
            &registry,
            "basalt_groups_limit_drops_total",
            "Groups dropped after the combined groups limit was reached",
            &["table"],
        );
        let query_processing_seconds = histogram_vec(
            &registry,
            "basalt_query_processing_seconds",
            "Server-side query processing time",
            &["table"],
        );

        Self {
            registry,
            request_deserialization_exceptions,
            response_serialization_exceptions,
            uncaught_exceptions,
            queries,
            missing_segments,
            scheduling_timeout_exceptions,
            query_execution_exceptions,
            groups_limit_drops,
            query_processing_seconds,
        }
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Counter {
    let c = Counter::new(name, help).expect("counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<ServerMetrics> = OnceLock::new();

/// Process-wide metrics instance, created on first access.
pub fn global_metrics() -> &'static ServerMetrics {
    GLOBAL_METRICS.get_or_init(ServerMetrics::new)
}
