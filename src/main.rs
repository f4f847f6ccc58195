//! feed-rewriter binary entrypoint.
//! Loads config, wires store + fetcher + generation endpoint into the
//! pipeline, then runs once, loops on the configured interval, or serves the
//! HTTP API (loop and serve combine).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_rewriter::api::{self, AppState};
use feed_rewriter::config::{AppConfig, ENV_CONFIG_PATH};
use feed_rewriter::generate::HttpConnector;
use feed_rewriter::ingest::{scheduler, HttpFeedFetcher};
use feed_rewriter::metrics::Metrics;
use feed_rewriter::pipeline::RewritePipeline;
use feed_rewriter::store::SqliteStore;

const DEFAULT_LOG_FILTER: &str = "feed_rewriter=info,pipeline=info,generate=info,ingest=info,warn";

#[derive(Parser, Debug)]
#[command(author, version, about = "Fetch feeds, skip what was seen, rewrite the rest", long_about = None)]
struct Cli {
    /// Path to the TOML config (default: config/feed_rewriter.toml)
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Keep running, one pass every `rss.interval` seconds
    #[arg(long = "loop")]
    run_loop: bool,

    /// Serve the HTTP API on `server.bind`
    #[arg(long)]
    serve: bool,
}

/// Logs go to stderr so a one-shot report on stdout stays machine readable.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional.
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let cfg = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(feeds = cfg.feeds().len(), model = ?cfg.llm.model_name, "configuration loaded");

    let store = Arc::new(
        SqliteStore::connect(&cfg.store.database_url)
            .await
            .with_context(|| format!("opening store {}", cfg.store.database_url))?,
    );
    let fetcher = Arc::new(HttpFeedFetcher::new(cfg.fetch_timeout())?);
    let connector = Arc::new(HttpConnector::new(cfg.api_url(), cfg.llm_timeout())?);
    let pipeline = RewritePipeline::new(
        store.clone(),
        fetcher,
        connector,
        cfg.pipeline_settings()?,
    );

    if let Err(e) = pipeline.reconcile(cfg.stale_mark_after()).await {
        warn!(error = %e, "startup reconciliation failed");
    }

    if !cli.run_loop && !cli.serve {
        let report = scheduler::run_cycle(&pipeline, &cfg).await;
        store.close().await;
        let report = report.context("run timed out")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (cfg_tx, cfg_rx) = watch::channel(Arc::new(cfg.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    let scheduled = cli.run_loop.then(|| {
        let path = cli.config.clone();
        let reload = move || AppConfig::load(path.as_deref());
        tokio::spawn(scheduler::run_loop(
            pipeline.clone(),
            cfg_tx,
            reload,
            stopped(stop_rx.clone()),
        ))
    });

    if cli.serve {
        let metrics = Metrics::init(cfg.rss.cache_ttl)?;
        let state = AppState {
            store: store.clone(),
            pipeline: pipeline.clone(),
            config: cfg_rx,
        };
        let app = api::router(state).merge(metrics.router());
        let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
            .await
            .with_context(|| format!("binding {}", cfg.server.bind))?;
        info!(bind = %cfg.server.bind, "serving HTTP API");
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(stop_rx.clone()))
            .await?;
    }

    if let Some(handle) = scheduled {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    store.close().await;
    Ok(())
}
