// src/ingest/scheduler.rs
//! Periodic runs. Each cycle re-reads the configuration so feed list and
//! interval changes apply without a restart; a config that fails to load
//! leaves the previous one in effect. The config in effect is published on a
//! `watch` channel so on-demand runs use the same one.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::pipeline::{RewritePipeline, RunReport};

/// Reconciles stale marks, then runs over the configured feeds, honouring
/// `rss.run_timeout`. `None` means the run timed out.
pub async fn run_cycle(pipeline: &RewritePipeline, cfg: &AppConfig) -> Option<RunReport> {
    if let Err(e) = pipeline.reconcile(cfg.stale_mark_after()).await {
        warn!(target: "ingest", error = %e, "reconciliation failed");
    }
    let feeds = cfg.feeds();
    if feeds.is_empty() {
        warn!(target: "ingest", "no feeds configured");
    }
    match cfg.run_timeout() {
        Some(limit) => pipeline.run_with_timeout(&feeds, limit).await,
        None => Some(pipeline.run(&feeds).await),
    }
}

/// Runs cycles until `shutdown` resolves, starting from the config held by
/// `config`. `reload` is called before every cycle after the first; a good
/// reload replaces the published config.
pub async fn run_loop<R, S>(
    pipeline: RewritePipeline,
    config: watch::Sender<Arc<AppConfig>>,
    mut reload: R,
    shutdown: S,
) where
    R: FnMut() -> Result<AppConfig, ConfigError>,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut cfg = config.borrow().clone();
    let mut cycle: u64 = 0;

    loop {
        if cycle > 0 {
            match reload() {
                Ok(fresh) => {
                    cfg = Arc::new(fresh);
                    config.send_replace(cfg.clone());
                }
                Err(e) => {
                    warn!(target: "ingest", error = %e, "config reload failed, keeping previous config")
                }
            }
        }
        cycle += 1;

        tokio::select! {
            report = run_cycle(&pipeline, &cfg) => match report {
                Some(r) => info!(
                    target: "ingest",
                    cycle,
                    sources = r.sources.len(),
                    rewritten = r.rewritten(),
                    articles = r.article_count(),
                    failed = r.failed(),
                    "scheduled run finished"
                ),
                None => warn!(target: "ingest", cycle, "scheduled run timed out"),
            },
            _ = &mut shutdown => {
                info!(target: "ingest", "shutdown requested during run");
                return;
            }
        }

        let wait = cfg.interval();
        info!(target: "ingest", next_in_s = wait.as_secs(), "sleeping until next run");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                info!(target: "ingest", "shutdown requested");
                return;
            }
        }
    }
}
