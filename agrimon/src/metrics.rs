use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agrimon_readings_received_total",
        "Total sensor readings submitted for ingest"
    ))
    .unwrap();
    pub static ref READINGS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agrimon_readings_accepted_total",
        "Total sensor readings appended to a sensor log"
    ))
    .unwrap();
    pub static ref READINGS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "agrimon_readings_rejected_total",
            "Total sensor readings rejected, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agrimon_mqtt_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "agrimon_rate_limited_total",
            "Total requests rejected by the rate limiter, by tier"
        ),
        &["tier"]
    )
    .unwrap();
    pub static ref IRRIGATION_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "agrimon_irrigation_transitions_total",
            "Total irrigation zone state transitions, by kind"
        ),
        &["transition"]
    )
    .unwrap();
    pub static ref ACTIVE_ZONES: IntGauge = IntGauge::with_opts(Opts::new(
        "agrimon_active_zones",
        "Irrigation zones currently watering"
    ))
    .unwrap();
    pub static ref COLLABORATOR_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "agrimon_collaborator_failures_total",
            "Failed calls to external collaborators, by service"
        ),
        &["service"]
    )
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agrimon_db_failures_total",
        "Total archive database insert failures"
    ))
    .unwrap();
    pub static ref ARCHIVE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "agrimon_archive_latency_seconds",
            "Time taken to archive a batch of readings"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "agrimon_archive_batch_size",
        "Current archive batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agrimon_archive_channel_full_total",
        "Total number of times the archive channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(READINGS_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_ACCEPTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MQTT_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMITED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IRRIGATION_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_ZONES.clone()))?;
    REGISTRY.register(Box::new(COLLABORATOR_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARCHIVE_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::errors::Error::Internal(e.to_string()))
}
