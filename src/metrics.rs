//! Process-wide builder metrics.
//!
//! All metrics live in one registry so the serving layer can expose them
//! from a single `/metrics` endpoint. Names are part of the external
//! contract and must not change between releases.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("name and help must be non-empty");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric names must be unique");
    counter
}

fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("name and help must be non-empty");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric names must be unique");
    gauge
}

lazy_static! {
    /// Registry holding every builder metric.
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref FETCHED_CHUNKS_TOTAL: IntCounter = register_counter(
        "tsdb_builder_fetched_chunks_total",
        "Chunks fetched from the chunk store.",
    );
    pub static ref FETCHED_CHUNKS_BYTES_TOTAL: IntCounter = register_counter(
        "tsdb_builder_fetched_chunks_bytes_total",
        "Encoded bytes fetched from the chunk store.",
    );
    pub static ref CHUNKS_NOT_FOUND_TOTAL: IntCounter = register_counter(
        "tsdb_builder_chunks_not_found_total",
        "Chunks referenced by a plan but missing from the chunk store.",
    );
    pub static ref SERIES_TOTAL: IntCounter = register_counter(
        "tsdb_builder_series_total",
        "Series written to blocks.",
    );
    pub static ref WRITTEN_SAMPLES_TOTAL: IntCounter = register_counter(
        "tsdb_builder_written_samples_total",
        "Samples written to blocks.",
    );
    pub static ref BLOCK_SIZE_BYTES_TOTAL: IntCounter = register_counter(
        "tsdb_builder_block_size_bytes_total",
        "Cumulative size of produced blocks.",
    );
    pub static ref IN_PROGRESS: IntGauge = register_gauge(
        "tsdb_builder_in_progress",
        "1 while a plan build is running, 0 otherwise.",
    );
    pub static ref SERIES_IN_MEMORY: IntGauge = register_gauge(
        "tsdb_builder_series_in_memory",
        "Series currently buffered in memory waiting for a spill.",
    );
}
