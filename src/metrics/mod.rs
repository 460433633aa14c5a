//! Prometheus instruments of the sync client.
//!
//! Nothing is exported over the network; embedders scrape the text encoding
//! returned by [`gather_metrics`].
use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::warn;

lazy_static! {
    pub static ref CACHED_DOCUMENT_BYTES: IntGauge = IntGauge::new(
        "cached_document_bytes",
        "Serialized size of all cached remote documents"
    )
    .expect("metric can not be created");

    pub static ref CACHED_DOCUMENTS: IntGauge =
        IntGauge::new("cached_documents", "Number of cached remote documents")
            .expect("metric can not be created");

    pub static ref PENDING_MUTATION_BATCHES: IntGauge = IntGauge::new(
        "pending_mutation_batches",
        "Mutation batches waiting for acknowledgement"
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_TARGETS: IntGauge =
        IntGauge::new("active_targets", "Query targets with at least one listener")
            .expect("metric can not be created");

    pub static ref ACTIVE_LIMBO_RESOLUTIONS: IntGauge = IntGauge::new(
        "active_limbo_resolutions",
        "Limbo documents with an open resolution listen"
    )
    .expect("metric can not be created");

    pub static ref ACKNOWLEDGED_WRITES: IntCounter =
        IntCounter::new("acknowledged_writes", "Mutation batches acknowledged by the backend")
            .expect("metric can not be created");

    pub static ref REJECTED_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("rejected_writes", "Mutation batches rejected by the backend"),
        &["code"]
    )
    .expect("metric can not be created");

    pub static ref STREAM_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("stream_failures", "Watch and write stream failures"),
        &["stream"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new_custom(Some("docsync".to_string()), None).unwrap_or_default();
        register_custom_metrics(&registry);
        registry
    };
}

pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CACHED_DOCUMENT_BYTES.clone()),
        Box::new(CACHED_DOCUMENTS.clone()),
        Box::new(PENDING_MUTATION_BATCHES.clone()),
        Box::new(ACTIVE_TARGETS.clone()),
        Box::new(ACTIVE_LIMBO_RESOLUTIONS.clone()),
        Box::new(ACKNOWLEDGED_WRITES.clone()),
        Box::new(REJECTED_WRITES.clone()),
        Box::new(STREAM_FAILURES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!("collector can not be registered: {:?}", e);
        }
    }
}

/// Text exposition of every registered metric.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode metrics: {:?}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
