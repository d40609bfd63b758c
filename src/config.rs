// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : program_flow_rust — real-time program-trading flow aggregator
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Subscribes to per-instrument program-trading ticks (mock/gateway),
          folds them into per-minute series, serves resampled chart/table
          views, persists snapshots (durable + fallback tiers), journals
          ticks as JSONL and exposes Prometheus metrics.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use clap::Parser;
use dotenvy::dotenv;
use tracing::warn;

use crate::resample::Interval;
use crate::store::DEFAULT_SERIES_CAP;

pub const DEFAULT_REST_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/api/program-trading/ws";
pub const DEFAULT_DATA_DIR: &str = "data/program_subscribe";
const KST_SECS: i32 = 9 * 3600;

/// Where subscriptions and ticks come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Gateway,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(FeedMode::Mock),
            "gateway" | "kis" => Some(FeedMode::Gateway),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Gateway => "gateway",
        }
    }
}

/// Backend of the durable snapshot tier. The fallback tier is always a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierKind {
    Http,
    File,
}

impl TierKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "server" => Some(TierKind::Http),
            "file" | "local" => Some(TierKind::File),
            _ => None,
        }
    }
}

/// Per-run overrides. Anything left out comes from env / .env.
#[derive(Parser, Debug, Default)]
#[command(name = "program_flow_rust", version, about = "Program-trading flow aggregator")]
pub struct Cli {
    /// Codes to subscribe at startup, comma separated (overrides CODES)
    #[arg(long, value_delimiter = ',')]
    pub codes: Option<Vec<String>>,

    /// Default view interval in minutes: 1, 3, 5, 10, 30 or 60
    #[arg(long)]
    pub interval: Option<u32>,

    /// mock | gateway
    #[arg(long)]
    pub feed_mode: Option<String>,

    /// Directory for snapshot files and the tick journal
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Do not read commands from stdin
    #[arg(long)]
    pub no_console: bool,
}

#[derive(Clone, Debug)]
pub struct Args {
    // source
    pub feed_mode: FeedMode,
    pub gateway_rest_url: String,
    pub gateway_ws_url: String,
    pub mock_tick: Duration,
    pub upstream_timeout: Duration,

    // store / views
    pub codes: Vec<String>,
    pub series_cap: usize,
    pub view_interval: Interval,
    pub market_offset: FixedOffset,

    // persistence
    pub snapshot_tier: TierKind,
    pub data_dir: PathBuf,
    pub flush_every: Duration,
    pub journal: bool,
    pub journal_retention_days: i64,

    // surfaces
    pub metrics_port: u16,
    pub console: bool,
}

impl Args {
    pub fn durable_file(&self) -> PathBuf {
        self.data_dir.join("server_snapshot.json")
    }

    pub fn fallback_file(&self) -> PathBuf {
        self.data_dir.join("local_snapshot.json")
    }
}

pub fn load() -> Args {
    // .env dulu, baru CLI
    let _ = dotenv();
    resolve(Cli::parse(), |k| env::var(k).ok())
}

/// Parses `+09:00`, `-0530`, `+9` style offsets.
pub fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => (rest.get(..2)?, rest.get(2..)?),
        None => (rest, "0"),
    };
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if !(0..=14).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

pub fn parse_codes(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let c = c.to_ascii_uppercase();
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

fn num<T: FromStr + Copy>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(%key, value = %raw, "invalid number, using default");
            default
        }),
    }
}

fn interval_or_default(raw: Option<u32>, source: &str) -> Interval {
    match raw.map(Interval::try_from) {
        None => Interval::M1,
        Some(Ok(i)) => i,
        Some(Err(e)) => {
            warn!(%source, error = %e, "using 1m");
            Interval::M1
        }
    }
}

fn resolve(cli: Cli, var: impl Fn(&str) -> Option<String>) -> Args {
    // ===== Source =====
    let feed_raw = cli.feed_mode.clone().or_else(|| var("FEED_MODE"));
    let feed_mode = match feed_raw.as_deref() {
        None => FeedMode::Mock,
        Some(s) => FeedMode::parse(s).unwrap_or_else(|| {
            warn!(value = %s, "unknown FEED_MODE, using mock");
            FeedMode::Mock
        }),
    };
    let gateway_rest_url = var("GATEWAY_REST_URL")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_REST_URL.to_string());
    let gateway_ws_url = var("GATEWAY_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
    let mock_tick = Duration::from_millis(num(&var, "MOCK_TICK_MS", 1000u64).max(10));
    let upstream_timeout = Duration::from_secs(num(&var, "UPSTREAM_TIMEOUT_SECS", 5u64).max(1));

    // ===== Store / views =====
    let codes = match &cli.codes {
        Some(list) => parse_codes(&list.join(",")),
        None => var("CODES").map(|s| parse_codes(&s)).unwrap_or_default(),
    };
    let series_cap = match num(&var, "SERIES_CAP", DEFAULT_SERIES_CAP) {
        0 => {
            warn!("SERIES_CAP must be positive, using default");
            DEFAULT_SERIES_CAP
        }
        n => n,
    };
    let view_interval = match cli.interval {
        Some(m) => interval_or_default(Some(m), "--interval"),
        None => interval_or_default(
            var("VIEW_INTERVAL").map(|s| s.trim().parse().unwrap_or(0)),
            "VIEW_INTERVAL",
        ),
    };
    let kst = FixedOffset::east_opt(KST_SECS).unwrap_or_else(|| Utc.fix());
    let market_offset = match var("MARKET_UTC_OFFSET") {
        None => kst,
        Some(s) => parse_offset(&s).unwrap_or_else(|| {
            warn!(value = %s, "invalid MARKET_UTC_OFFSET, using +09:00");
            kst
        }),
    };

    // ===== Persistence =====
    let default_tier = match feed_mode {
        FeedMode::Gateway => TierKind::Http,
        FeedMode::Mock => TierKind::File,
    };
    let snapshot_tier = match var("SNAPSHOT_TIER") {
        None => default_tier,
        Some(s) => TierKind::parse(&s).unwrap_or_else(|| {
            warn!(value = %s, "unknown SNAPSHOT_TIER, using default");
            default_tier
        }),
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| var("DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let flush_every = Duration::from_secs(num(&var, "FLUSH_INTERVAL_SECS", 5u64).max(1));
    let journal = var("JOURNAL")
        .map(|s| !matches!(s.trim().to_ascii_lowercase().as_str(), "off" | "0" | "false" | "no"))
        .unwrap_or(true);
    let journal_retention_days = num(&var, "JOURNAL_RETENTION_DAYS", 30i64).max(1);

    Args {
        feed_mode,
        gateway_rest_url,
        gateway_ws_url,
        mock_tick,
        upstream_timeout,
        codes,
        series_cap,
        view_interval,
        market_offset,
        snapshot_tier,
        data_dir,
        flush_every,
        journal,
        journal_retention_days,
        metrics_port: num(&var, "METRICS_PORT", 9899u16),
        console: !cli.no_console,
    }
}
