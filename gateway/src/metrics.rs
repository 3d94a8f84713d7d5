use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref QUERIES_SUBMITTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_queries_submitted_total",
        "Total queries submitted to the analytics engine"
    ))
    .unwrap();
    pub static ref QUERIES_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_queries_failed_total",
        "Total executions that ended FAILED or CANCELLED"
    ))
    .unwrap();
    pub static ref QUERY_TIMEOUTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_query_timeouts_total",
        "Total executions abandoned without a terminal state"
    ))
    .unwrap();
    pub static ref POLL_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_poll_attempts_total",
        "Total execution status checks"
    ))
    .unwrap();
    pub static ref MALFORMED_ROWS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_malformed_rows_total",
        "Total result rows skipped for missing or unparseable fields"
    ))
    .unwrap();
    pub static ref DEGRADED_DEVICE_RECORDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_degraded_device_records_total",
        "Total device records replaced with placeholders"
    ))
    .unwrap();
    pub static ref FORBIDDEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_forbidden_total",
        "Total requests for devices outside the caller's grants"
    ))
    .unwrap();
    pub static ref QUERY_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_query_latency_seconds",
            "Time from submission to fetched results"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(QUERIES_SUBMITTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(QUERIES_FAILED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(QUERY_TIMEOUTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLL_ATTEMPTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MALFORMED_ROWS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEGRADED_DEVICE_RECORDS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(FORBIDDEN_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(QUERY_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
