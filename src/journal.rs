// ===============================
// src/journal.rs
// ===============================
//
// Per-day JSONL tick journal:
// - Every accepted tick is appended to `pt_history_YYYYMMDD.jsonl` (market date).
// - Buffered with BufWriter, flushed every 1s and/or every 1000 events.
// - Rolls over to a new file when the tick date changes.
// - On a write error the file is reopened and the line retried once.
// - At startup: old files are purged, today's file is replayed into the store.
//
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDate};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::domain::TickEvent;
use crate::metrics::JOURNAL_LINES;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

pub fn file_name(date: NaiveDate) -> String {
    format!("pt_history_{}.jsonl", date.format("%Y%m%d"))
}

fn date_of(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_prefix("pt_history_")?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem, "%Y%m%d").ok()
}

async fn open_writer(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<TickEvent>, dir: PathBuf) {
    info!(dir = %dir.display(), "journal: started");
    let mut current: Option<(NaiveDate, BufWriter<File>)> = None;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    if let Some((_, w)) = current.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("journal: channel closed, stopped");
                    break;
                };

                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "journal: serialize error, skip tick");
                        continue;
                    }
                };

                let date = ev.ts.date_naive();
                let path = dir.join(file_name(date));
                if current.as_ref().map(|(d, _)| *d) != Some(date) {
                    if let Some((_, mut old)) = current.take() {
                        let _ = old.flush().await;
                    }
                    match open_writer(&path).await {
                        Ok(w) => current = Some((date, w)),
                        Err(e) => {
                            error!(?e, path = %path.display(), "journal: open failed, drop tick");
                            continue;
                        }
                    }
                }
                let Some((_, writer)) = current.as_mut() else { continue };

                if let Err(e) = write_line(writer, &line).await {
                    error!(?e, "journal: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(mut w) => {
                            if let Err(e2) = write_line(&mut w, &line).await {
                                error!(?e2, "journal: write failed again after reopen, drop tick");
                            }
                            current = Some((date, w));
                        }
                        Err(e2) => {
                            error!(?e2, "journal: reopen failed, drop tick");
                            current = None;
                        }
                    }
                    continue;
                }
                JOURNAL_LINES.inc();

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if let Some((_, w)) = current.as_mut() {
                    let _ = w.flush().await;
                }
                since_last_flush = 0;
            }
        }
    }
}

/// All parseable ticks journaled on `date`. Broken lines are skipped.
pub async fn load_day(dir: &Path, date: NaiveDate) -> Vec<TickEvent> {
    let path = dir.join(file_name(date));
    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    let mut skipped = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<TickEvent>(&line) {
                Ok(ev) => out.push(ev),
                Err(_) => skipped += 1,
            },
            Ok(None) => break,
            Err(e) => {
                error!(?e, path = %path.display(), "journal: read failed, replay truncated");
                break;
            }
        }
    }
    if skipped > 0 {
        debug!(skipped, "journal: skipped unreadable lines");
    }
    out
}

/// Deletes journal files older than `retention_days`. Returns how many were removed.
pub async fn cleanup(dir: &Path, today: NaiveDate, retention_days: i64) -> usize {
    let cutoff = today - ChronoDuration::days(retention_days);
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(date) = date_of(&name) else { continue };
        if date < cutoff {
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!(file = %name, "journal: removed old history file");
                    removed += 1;
                }
                Err(e) => error!(?e, file = %name, "journal: remove failed"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{at, tick};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pt-journal-{}", rand::random::<u64>()))
    }

    #[test]
    fn test_file_name_round_trip() {
        let d = at(9, 0, 0).date_naive();
        assert_eq!(file_name(d), "pt_history_20261019.jsonl");
        assert_eq!(date_of(&file_name(d)), Some(d));
        assert_eq!(date_of("pt_data.json"), None);
    }

    #[tokio::test]
    async fn test_journal_writes_and_replays_today() {
        let dir = temp_dir();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, dir.clone()));
        tx.send(tick("005930", at(10, 0, 15), 500_000, 120)).await.unwrap();
        tx.send(tick("005930", at(10, 0, 45), 520_000, 120)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let path = dir.join(file_name(at(0, 0, 0).date_naive()));
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("garbage line\n");
        std::fs::write(&path, raw).unwrap();

        let replay = load_day(&dir, at(0, 0, 0).date_naive()).await;
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[1].net_value, 520_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_files() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        for name in [
            "pt_history_20260901.jsonl",
            "pt_history_20261010.jsonl",
            "pt_data.json",
        ] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        let removed = cleanup(&dir, at(0, 0, 0).date_naive(), 30).await;
        assert_eq!(removed, 1);
        assert!(!dir.join("pt_history_20260901.jsonl").exists());
        assert!(dir.join("pt_history_20261010.jsonl").exists());
        assert!(dir.join("pt_data.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
