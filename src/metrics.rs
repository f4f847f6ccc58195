// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the Prometheus recorder and describes every series the
    /// pipeline emits. Exposes the configured cache TTL as a static gauge.
    pub fn init(cache_ttl_s: u64) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        describe_counter!("pipeline_runs_total", "Pipeline runs started");
        describe_counter!(
            "pipeline_items_total",
            "Items handled, labelled by outcome (rewritten, served, skipped, failed)"
        );
        describe_counter!("generation_attempts_total", "Calls sent to the generation backend");
        describe_counter!("generation_failures_total", "Prompts that failed after all attempts");
        describe_histogram!(
            "generation_latency_ms",
            Unit::Milliseconds,
            "Wall time per prompt, retries included"
        );
        describe_counter!("cache_hits_total", "Freshness cache hits");
        describe_counter!("cache_misses_total", "Freshness cache misses (absent or expired)");
        describe_counter!("ingest_fetch_errors_total", "Feed downloads or parses that failed");
        describe_counter!("ingest_items_total", "Items parsed from feeds");
        describe_histogram!("ingest_parse_ms", Unit::Milliseconds, "Feed parse time");

        gauge!("feed_cache_ttl_seconds").set(cache_ttl_s as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
