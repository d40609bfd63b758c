// ===============================
// src/main.rs
// ===============================
/*
 # state per code
curl -s localhost:9899/metrics | grep '^pt_series_buckets'

 # tick flow & drops
curl -s localhost:9899/metrics | egrep '^pt_ticks_(total|dropped)'

 # snapshot writes per tier
curl -s localhost:9899/metrics | grep '^pt_snapshot_flushes_total'
*/
/*
=============================================================================
Project : program_flow_rust — real-time program-trading flow aggregator
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Subscribes to per-instrument program-trading ticks (mock/gateway),
          folds them into per-minute series, serves resampled chart/table
          views, persists snapshots (durable + fallback tiers), journals
          ticks as JSONL and exposes Prometheus metrics.
=============================================================================
*/
mod config;
mod console;
mod domain;
mod engine;
mod error;
mod feed;
mod journal;
mod metrics;
mod persist;
mod registry;
mod render;
mod resample;
mod store;

use std::sync::Arc;

use chrono::Utc;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FeedMode, TierKind};
use crate::domain::TickEvent;
use crate::engine::{Engine, EngineCfg};
use crate::error::FlowError;
use crate::feed::{GatewayUpstream, MockUpstream, Upstream};
use crate::persist::{PersistManager, SnapshotTier};
use crate::store::SeriesStore;

const HEARTBEAT_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        feed_mode = args.feed_mode.as_str(),
        snapshot_tier = ?args.snapshot_tier,
        codes = ?args.codes,
        data_dir = %args.data_dir.display(),
        market_offset = %args.market_offset,
        interval = %args.view_interval,
        rest = %args.gateway_rest_url,
        ws = %args.gateway_ws_url,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);

    // ---- Upstream + snapshot tiers ----
    let http = match reqwest::Client::builder()
        .timeout(args.upstream_timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(?e, "http client build failed");
            return;
        }
    };
    let upstream = match args.feed_mode {
        FeedMode::Mock => Upstream::Mock(MockUpstream::new(Some(args.mock_tick), args.market_offset)),
        FeedMode::Gateway => Upstream::Gateway(GatewayUpstream::new(
            http.clone(),
            &args.gateway_rest_url,
            &args.gateway_ws_url,
            args.market_offset,
        )),
    };
    let durable = match args.snapshot_tier {
        TierKind::Http => SnapshotTier::Http {
            http: http.clone(),
            base: args.gateway_rest_url.clone(),
        },
        TierKind::File => SnapshotTier::File { path: args.durable_file() },
    };
    let persist = PersistManager::new(durable, SnapshotTier::File { path: args.fallback_file() });

    // ---- Journal (optional) ----
    let today = Utc::now().with_timezone(&args.market_offset).date_naive();
    let (journal_tx, journal_task) = if args.journal {
        let removed = journal::cleanup(&args.data_dir, today, args.journal_retention_days).await;
        if removed > 0 {
            info!(removed, "journal: old files purged");
        }
        let (tx, rx) = mpsc::channel::<TickEvent>(8192);
        (Some(tx), Some(tokio::spawn(journal::run(rx, args.data_dir.clone()))))
    } else {
        (None, None)
    };

    // ---- Engine: restore -> replay -> resume ----
    let (mut engine, handle) = Engine::new(
        SeriesStore::new(args.series_cap),
        upstream,
        persist,
        journal_tx,
        EngineCfg {
            flush_every: args.flush_every,
            offset: args.market_offset,
        },
    );
    if !engine.restore().await {
        info!("cold start");
    }
    if args.journal {
        let ticks = journal::load_day(&args.data_dir, today).await;
        let total = ticks.len();
        let applied = engine.replay(ticks);
        info!(applied, total, "journal: replayed today");
    }
    engine.resume();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let engine_task = tokio::spawn(engine.run(shutdown_tx.subscribe()));

    for code in &args.codes {
        match handle.subscribe(code).await {
            Ok(name) => info!(%code, %name, "startup subscribe"),
            Err(FlowError::AlreadySubscribed(_)) => debug!(%code, "already restored"),
            Err(e) => warn!(%code, error = %e, "startup subscribe failed"),
        }
    }

    // ---- Console ----
    if args.console {
        tokio::spawn(console::run(
            handle.clone(),
            args.view_interval,
            Arc::clone(&shutdown_tx),
        ));
    }

    // ---- Heartbeat until ctrl-c / quit ----
    let mut beat = interval(Duration::from_secs(HEARTBEAT_SECS));
    let mut last_ticks = metrics::TICKS.get();
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                shutdown_tx.send_replace(true);
                break;
            }
            _ = shutdown_rx.changed() => break,
            _ = beat.tick() => {
                let ticks = metrics::TICKS.get();
                match handle.status().await {
                    Ok(st) => {
                        let buckets: usize = st.codes.iter().map(|(_, _, n)| n).sum();
                        info!(
                            status = %st.conn,
                            codes = st.codes.len(),
                            buckets,
                            ticks = ticks - last_ticks,
                            "heartbeat"
                        );
                    }
                    Err(e) => warn!(error = %e, "heartbeat: engine unavailable"),
                }
                last_ticks = ticks;
            }
        }
    }

    // engine writes the final snapshot, then drops the journal sender
    if let Err(e) = engine_task.await {
        error!(?e, "engine task failed");
    }
    if let Some(task) = journal_task {
        let _ = task.await;
    }
    info!("stopped");
}
