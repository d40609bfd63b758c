// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pt_ticks_total", "program-trading ticks ingested").unwrap());

pub static TICKS_BY_CODE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pt_ticks_total_by_code", "ticks ingested per instrument code"),
        &["code"],
    )
    .unwrap()
});

pub static TICKS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pt_ticks_dropped_total", "ticks dropped (labels: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static SERIES_LEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("pt_series_buckets", "minute buckets held per code"),
        &["code"],
    )
    .unwrap()
});

// -------- Subscriptions / stream --------
pub static SUBSCRIBED_CODES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pt_subscribed_codes", "live subscriptions").unwrap());

pub static STREAM_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("pt_stream_connected", "1 if the shared event stream is connected").unwrap()
});

// -------- Persistence --------
pub static SNAPSHOT_FLUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pt_snapshot_flushes_total", "snapshot writes (labels: tier, result)"),
        &["tier", "result"],
    )
    .unwrap()
});

pub static JOURNAL_LINES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pt_journal_lines_total", "ticks written to the journal").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_CODE.clone())),
        REGISTRY.register(Box::new(TICKS_DROPPED.clone())),
        REGISTRY.register(Box::new(SERIES_LEN.clone())),
        REGISTRY.register(Box::new(SUBSCRIBED_CODES.clone())),
        REGISTRY.register(Box::new(STREAM_CONNECTED.clone())),
        REGISTRY.register(Box::new(SNAPSHOT_FLUSHES.clone())),
        REGISTRY.register(Box::new(JOURNAL_LINES.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
    ] {
        let _ = m;
    }
}

fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# pt: no samples yet\n");
    }
    buf
}

/// Full HTTP response for one raw request. Only `GET /metrics` (and `/`)
/// is served; anything else is a 404 so scrapers notice a wrong path.
fn response_for(request: &[u8]) -> Vec<u8> {
    let line = request.split(|b| *b == b'\n').next().unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    let (method, target) = (parts.next(), parts.next());
    let path = target.map(|t| t.split('?').next().unwrap_or(t));

    let (status, content_type, body) = match (method, path) {
        (Some("GET"), Some("/metrics" | "/")) => (
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            encode_metrics(),
        ),
        (Some("GET"), _) => ("404 Not Found", "text/plain; charset=utf-8", b"try /metrics\n".to_vec()),
        _ => ("405 Method Not Allowed", "text/plain; charset=utf-8", b"GET only\n".to_vec()),
    };
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let _ = stream.write_all(&response_for(&req[..n]));
    let _ = stream.flush();
}

// Metrics server on a dedicated OS thread (keeps the Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed, endpoint disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
