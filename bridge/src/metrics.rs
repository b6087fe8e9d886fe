use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref VALID_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_valid_readings_total",
        "Total telemetry messages accepted after validation"
    ))
    .unwrap();
    pub static ref INVALID_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_invalid_readings_total",
        "Total telemetry messages rejected"
    ))
    .unwrap();
    pub static ref UNKNOWN_MEASUREMENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_unknown_measurements_total",
        "Total unknown measurement kinds dropped from telemetry"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref READINGS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_readings_dropped_total",
        "Total validated readings lost to storage failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bridge_ingest_latency_seconds",
            "Time taken to ingest batch into DB"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "bridge_batch_size",
        "Current batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref STATUS_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_status_messages_total",
        "Total device status messages received"
    ))
    .unwrap();
    pub static ref COMMANDS_DISPATCHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_commands_dispatched_total",
        "Total commands published to devices"
    ))
    .unwrap();
    pub static ref DISPATCH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_dispatch_failures_total",
        "Total commands that could not be published"
    ))
    .unwrap();
    pub static ref COMMANDS_RESOLVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "bridge_commands_resolved_total",
            "Total commands that reached a terminal state"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref RESPONSES_DISCARDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_responses_discarded_total",
        "Total late or duplicate device responses ignored"
    ))
    .unwrap();
    pub static ref RESPONSES_UNMATCHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_responses_unmatched_total",
        "Total device responses that could not be correlated"
    ))
    .unwrap();
    pub static ref COMMANDS_PENDING: IntGauge = IntGauge::with_opts(Opts::new(
        "bridge_commands_pending",
        "Commands currently awaiting a device response"
    ))
    .unwrap();
    pub static ref COMMANDS_EVICTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_commands_evicted_total",
        "Total terminal commands evicted after retention"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VALID_READINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_READINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNKNOWN_MEASUREMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_DISPATCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_RESOLVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_DISCARDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_UNMATCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_PENDING.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_EVICTED_TOTAL.clone()))?;
    Ok(())
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
