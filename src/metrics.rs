//! Metrics collection and monitoring

use anyhow::Result;
use metrics::{describe_counter, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use pricing_engine::EngineStats;

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the global Prometheus recorder once and returns its handle.
pub fn install_prometheus() -> Result<&'static PrometheusHandle> {
    PROMETHEUS.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe_metrics();
        Ok(handle)
    })
}

pub fn describe_metrics() {
    describe_counter!("store_writes_total", "Cell writes accepted by the price store");
    describe_counter!("store_stale_reads_total", "Reads that raced a writer twice and gave up");
    describe_counter!("cache_l1_hits_total", "Lookups served from L1");
    describe_counter!("cache_l2_hits_total", "Lookups served from L2");
    describe_counter!("cache_l3_hits_total", "Lookups served from L3");
    describe_counter!("cache_misses_total", "Lookups that found no usable entry");
    describe_counter!("cache_evictions_total", "Cells demoted out of L1");
    describe_counter!("cache_tier_failures_total", "L2/L3 calls that failed or timed out");
    describe_counter!("detector_opportunities_total", "Opportunities emitted");
    describe_counter!("detector_budget_exceeded_total", "Detection cycles truncated by their budget");
    describe_counter!("detector_invalid_routes_total", "Candidate paths discarded as unquotable");
    describe_histogram!("detector_cycle_latency_ns", Unit::Nanoseconds, "Detection cycle wall time");
    describe_counter!("publisher_dropped_total", "Opportunities dropped by a full publisher");
    describe_counter!("cache_write_behind_dropped_total", "Write-throughs abandoned after retries");
    describe_counter!("ingest_backpressure_total", "Updates refused by a full ingestion queue");
    describe_counter!("ingest_updates_total", "Updates received by ingestion workers");
    describe_histogram!("ingest_batch_latency_ns", Unit::Nanoseconds, "Ingestion batch apply time");
    describe_counter!("engine_capacity_rejections_total", "Updates dropped for index capacity");
}

/// Mirrors point-in-time engine state as gauges.
pub fn record_engine_stats(stats: &EngineStats) {
    gauge!("cache_l1_resident").set(stats.cache.resident as f64);
    gauge!("cache_pending_writes").set(stats.cache.pending_writes as f64);
    gauge!("cache_staged_demotions").set(stats.cache.staged_demotions as f64);
    gauge!("detector_tokens").set(stats.detector.tokens as f64);
    gauge!("detector_edges").set(stats.detector.edges as f64);
    gauge!("detector_pending_pairs").set(stats.detector.pending_pairs as f64);
    gauge!("tracker_pairs").set(stats.tracker.tracked_pairs as f64);
}
