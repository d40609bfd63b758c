// ===============================
// src/persist.rs (Persistence Manager)
// ===============================
//
// Two tiers, same JSON shape (chartData / subscribedCodes / codeNameMap / savedAt):
// - durable : gateway `/program-trading/save-data|load-data`, or a local file
// - fallback: local file next to the journal
//
// Save is best-effort on both tiers (failures are logged and counted, never
// returned). Restore tries durable first, then fallback, then starts cold.
// Restored data is always cut at the start of the current market day.
//
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, TimeZone};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::Snapshot;
use crate::error::FlowError;
use crate::metrics::SNAPSHOT_FLUSHES;

#[derive(Clone)]
pub enum SnapshotTier {
    File { path: PathBuf },
    Http { http: reqwest::Client, base: String },
}

#[derive(Debug, Deserialize)]
struct LoadRsp {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SaveRsp {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: Option<String>,
}

impl SnapshotTier {
    pub async fn save(&self, snap: &Snapshot) -> Result<(), FlowError> {
        match self {
            SnapshotTier::File { path } => write_json_atomic(path, snap)
                .await
                .map_err(FlowError::PersistSaveFailure),
            SnapshotTier::Http { http, base } => {
                let url = format!("{base}/program-trading/save-data");
                let rsp = http
                    .post(url)
                    .json(snap)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| FlowError::PersistSaveFailure(e.to_string()))?;
                let ack = rsp
                    .json::<SaveRsp>()
                    .await
                    .map_err(|e| FlowError::PersistSaveFailure(e.to_string()))?;
                if !ack.success {
                    return Err(FlowError::PersistSaveFailure(
                        ack.msg.unwrap_or_else(|| "rejected".into()),
                    ));
                }
                Ok(())
            }
        }
    }

    pub async fn load(&self) -> Result<Snapshot, FlowError> {
        match self {
            SnapshotTier::File { path } => {
                let raw = fs::read_to_string(path)
                    .await
                    .map_err(|e| FlowError::PersistLoadFailure(format!("{}: {e}", path.display())))?;
                serde_json::from_str(&raw).map_err(|e| FlowError::RestoreParseFailure(e.to_string()))
            }
            SnapshotTier::Http { http, base } => {
                let url = format!("{base}/program-trading/load-data");
                let rsp = http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| FlowError::PersistLoadFailure(e.to_string()))?;
                let body = rsp
                    .json::<LoadRsp>()
                    .await
                    .map_err(|e| FlowError::RestoreParseFailure(e.to_string()))?;
                match (body.success, body.data) {
                    (true, Some(data)) => serde_json::from_value(data)
                        .map_err(|e| FlowError::RestoreParseFailure(e.to_string())),
                    _ => Err(FlowError::PersistLoadFailure(
                        body.msg.unwrap_or_else(|| "no snapshot".into()),
                    )),
                }
            }
        }
    }
}

async fn write_json_atomic(path: &Path, snap: &Snapshot) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
    }
    let body = serde_json::to_vec_pretty(snap).map_err(|e| e.to_string())?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).await.map_err(|e| e.to_string())?;
    fs::rename(&tmp, path).await.map_err(|e| e.to_string())
}

#[derive(Clone)]
pub struct PersistManager {
    durable: SnapshotTier,
    fallback: SnapshotTier,
}

impl PersistManager {
    pub fn new(durable: SnapshotTier, fallback: SnapshotTier) -> Self {
        Self { durable, fallback }
    }

    /// Writes both tiers. Errors end up in logs and metrics; the return value
    /// is true when at least one tier holds the snapshot.
    pub async fn save(&self, snap: &Snapshot) -> bool {
        let mut saved = false;
        for (tier, store) in [("durable", &self.durable), ("fallback", &self.fallback)] {
            match store.save(snap).await {
                Ok(()) => {
                    SNAPSHOT_FLUSHES.with_label_values(&[tier, "ok"]).inc();
                    saved = true;
                }
                Err(e) => {
                    SNAPSHOT_FLUSHES.with_label_values(&[tier, "err"]).inc();
                    warn!(tier, error = %e, "snapshot save failed");
                }
            }
        }
        saved
    }

    /// Durable tier, then fallback tier, then `None` (cold start).
    /// Buckets older than `day_start` are removed from whatever was loaded.
    pub async fn restore(&self, day_start: DateTime<FixedOffset>) -> Option<Snapshot> {
        let mut snap = match self.durable.load().await {
            Ok(s) => {
                info!(codes = s.subscribed_codes.len(), "snapshot restored from durable tier");
                s
            }
            Err(e) => {
                warn!(error = %e, "durable tier unavailable, trying fallback");
                match self.fallback.load().await {
                    Ok(s) => {
                        info!(codes = s.subscribed_codes.len(), "snapshot restored from fallback tier");
                        s
                    }
                    Err(e) => {
                        info!(error = %e, "no snapshot to restore, cold start");
                        return None;
                    }
                }
            }
        };
        let dropped = retain_day(&mut snap, day_start);
        if dropped > 0 {
            info!(dropped, %day_start, "dropped buckets from previous days");
        }
        Some(snap)
    }
}

/// Local midnight of `now` in its own offset.
pub fn day_start(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let Some(midnight) = now.date_naive().and_hms_opt(0, 0, 0) else {
        return now;
    };
    now.offset()
        .from_local_datetime(&midnight)
        .single()
        .unwrap_or(now)
}

/// Removes every bucket before `day_start`. Returns how many were removed.
pub fn retain_day(snap: &mut Snapshot, day_start: DateTime<FixedOffset>) -> usize {
    let before = snap.bucket_count();
    for buckets in snap.chart_data.values_mut() {
        buckets.retain(|b| b.minute_start >= day_start);
    }
    before - snap.bucket_count()
}

// ---- Manual export / import ----

pub async fn export_to(path: &Path, snap: &Snapshot) -> Result<(), FlowError> {
    write_json_atomic(path, snap)
        .await
        .map_err(FlowError::PersistSaveFailure)
}

/// Reads and validates a user-supplied snapshot file. Nothing is applied here.
pub async fn read_import(path: &Path) -> Result<Snapshot, FlowError> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| FlowError::InvalidImportFile(format!("{}: {e}", path.display())))?;
    let v: Value =
        serde_json::from_str(&raw).map_err(|e| FlowError::InvalidImportFile(e.to_string()))?;
    for (key, ok) in [
        ("chartData", v.get("chartData").is_some_and(Value::is_object)),
        ("subscribedCodes", v.get("subscribedCodes").is_some_and(Value::is_array)),
        ("codeNameMap", v.get("codeNameMap").is_some_and(Value::is_object)),
    ] {
        if !ok {
            return Err(FlowError::InvalidImportFile(format!("missing or malformed {key}")));
        }
    }
    serde_json::from_value(v).map_err(|e| FlowError::InvalidImportFile(e.to_string()))
}
