// ===============================
// src/engine.rs
// ===============================
//
// Single serialized event loop. It is the only writer of the SeriesStore:
//   ticks (shared stream) ─┐
//   commands (handle)     ─┼─> select! ─> store / registry / persistence
//   broker answers        ─┤
//   flush timer, status   ─┘
// Reads (views, series) get copies, so nothing outside sees a half-applied tick.
// Nothing here awaits I/O: broker calls go through the registry's worker and
// snapshot writes run on a spawned task that reports back whether they landed.
//
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{ConnStatus, MinuteBucket, Snapshot, TickEvent};
use crate::error::FlowError;
use crate::feed::Upstream;
use crate::metrics::{SERIES_LEN, STREAM_CONNECTED, TICKS, TICKS_BY_CODE, TICKS_DROPPED};
use crate::persist::{self, day_start, retain_day, PersistManager};
use crate::registry::{Registry, UpstreamDone};
use crate::render::{self, FlowView};
use crate::resample::Interval;
use crate::store::SeriesStore;

pub enum Command {
    Subscribe { code: String, reply: oneshot::Sender<Result<String, FlowError>> },
    Unsubscribe { code: String, reply: oneshot::Sender<Result<(), FlowError>> },
    UnsubscribeAll { reply: oneshot::Sender<()> },
    SetFilter { codes: Vec<String>, reply: oneshot::Sender<Result<(), FlowError>> },
    View { interval: Interval, reply: oneshot::Sender<FlowView> },
    Series { code: String, reply: oneshot::Sender<Option<Vec<MinuteBucket>>> },
    Status { reply: oneshot::Sender<StatusView> },
    Export { path: PathBuf, reply: oneshot::Sender<Result<usize, FlowError>> },
    /// The snapshot must already be validated and confirmed by the user.
    Import { snapshot: Snapshot, reply: oneshot::Sender<Result<usize, FlowError>> },
}

#[derive(Debug, Clone)]
pub struct StatusView {
    pub conn: ConnStatus,
    /// (code, display name, bucket count) in subscription order
    pub codes: Vec<(String, String, usize)>,
    pub filter: Vec<String>,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
pub struct EngineCfg {
    pub flush_every: Duration,
    pub offset: FixedOffset,
}

#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    #[cfg(test)]
    tick_tx: mpsc::Sender<TickEvent>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, FlowError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| FlowError::EngineClosed)?;
        rx.await.map_err(|_| FlowError::EngineClosed)
    }

    pub async fn subscribe(&self, code: &str) -> Result<String, FlowError> {
        let code = code.to_string();
        self.request(|reply| Command::Subscribe { code, reply }).await?
    }

    pub async fn unsubscribe(&self, code: &str) -> Result<(), FlowError> {
        let code = code.to_string();
        self.request(|reply| Command::Unsubscribe { code, reply }).await?
    }

    pub async fn unsubscribe_all(&self) -> Result<(), FlowError> {
        self.request(|reply| Command::UnsubscribeAll { reply }).await
    }

    pub async fn set_filter(&self, codes: Vec<String>) -> Result<(), FlowError> {
        self.request(|reply| Command::SetFilter { codes, reply }).await?
    }

    pub async fn view(&self, interval: Interval) -> Result<FlowView, FlowError> {
        self.request(|reply| Command::View { interval, reply }).await
    }

    pub async fn series(&self, code: &str) -> Result<Option<Vec<MinuteBucket>>, FlowError> {
        let code = code.to_string();
        self.request(|reply| Command::Series { code, reply }).await
    }

    pub async fn status(&self) -> Result<StatusView, FlowError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn export(&self, path: PathBuf) -> Result<usize, FlowError> {
        self.request(|reply| Command::Export { path, reply }).await?
    }

    pub async fn import(&self, snapshot: Snapshot) -> Result<usize, FlowError> {
        self.request(|reply| Command::Import { snapshot, reply }).await?
    }

    /// Publisher side of the shared stream.
    #[cfg(test)]
    pub fn ticks(&self) -> mpsc::Sender<TickEvent> {
        self.tick_tx.clone()
    }
}

pub struct Engine {
    store: SeriesStore,
    registry: Registry,
    persist: PersistManager,
    journal_tx: Option<mpsc::Sender<TickEvent>>,
    cfg: EngineCfg,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    tick_rx: Option<mpsc::Receiver<TickEvent>>,
    done_rx: Option<mpsc::Receiver<UpstreamDone>>,
    /// flush tasks report `true` when at least one tier took the snapshot
    flushed_tx: mpsc::Sender<bool>,
    flushed_rx: Option<mpsc::Receiver<bool>>,
    flush_in_flight: bool,
}

impl Engine {
    pub fn new(
        store: SeriesStore,
        upstream: Upstream,
        persist: PersistManager,
        journal_tx: Option<mpsc::Sender<TickEvent>>,
        cfg: EngineCfg,
    ) -> (Engine, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
        let (tick_tx, tick_rx) = mpsc::channel::<TickEvent>(4096);
        let (flushed_tx, flushed_rx) = mpsc::channel::<bool>(1);
        let (registry, done_rx) = Registry::new(upstream, tick_tx.clone());
        let engine = Engine {
            store,
            registry,
            persist,
            journal_tx,
            cfg,
            cmd_rx: Some(cmd_rx),
            tick_rx: Some(tick_rx),
            done_rx: Some(done_rx),
            flushed_tx,
            flushed_rx: Some(flushed_rx),
            flush_in_flight: false,
        };
        let handle = EngineHandle {
            cmd_tx,
            #[cfg(test)]
            tick_tx,
        };
        (engine, handle)
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.cfg.offset)
    }

    /// Load the newest same-day snapshot (durable, then fallback). Returns
    /// false on cold start.
    pub async fn restore(&mut self) -> bool {
        let today = day_start(self.now());
        match self.persist.restore(today).await {
            Some(snap) => {
                self.store.load_snapshot(snap);
                self.refresh_series_metrics();
                true
            }
            None => false,
        }
    }

    /// Re-apply journaled ticks. Only subscribed codes are touched.
    pub fn replay(&mut self, ticks: Vec<TickEvent>) -> usize {
        let applied = ticks.iter().filter(|ev| self.store.ingest(ev)).count();
        self.refresh_series_metrics();
        applied
    }

    /// Queue broker subscriptions for restored codes.
    pub fn resume(&mut self) {
        self.registry.resume(&self.store);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (Some(mut cmd_rx), Some(mut tick_rx), Some(mut done_rx), Some(mut flushed_rx)) = (
            self.cmd_rx.take(),
            self.tick_rx.take(),
            self.done_rx.take(),
            self.flushed_rx.take(),
        ) else {
            return;
        };
        let mut status_rx = self.registry.status();
        let mut flush = interval(self.cfg.flush_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.reset();
        info!(flush_every = ?self.cfg.flush_every, "engine: started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(ev) = tick_rx.recv() => self.on_tick(ev),
                Some(done) = done_rx.recv() => self.registry.complete(&mut self.store, done),
                Some(saved) = flushed_rx.recv() => self.on_flushed(saved),
                Some(cmd) = cmd_rx.recv() => self.on_command(cmd),
                Ok(()) = status_rx.changed() => {
                    let status = *status_rx.borrow_and_update();
                    STREAM_CONNECTED.set(i64::from(status == ConnStatus::Connected));
                    match status {
                        ConnStatus::Lost => warn!(error = %FlowError::ConnectionLost("stream ended".into()), "status: lost"),
                        s => info!(status = %s, "status"),
                    }
                }
                _ = flush.tick() => self.flush(),
            }
        }

        // final flush: wait for the in-flight write, then write unconditionally
        if self.flush_in_flight {
            let _ = flushed_rx.recv().await;
        }
        let snap = self.store.snapshot(self.now());
        self.persist.save(&snap).await;
        info!(codes = snap.subscribed_codes.len(), buckets = snap.bucket_count(), "engine: stopped, final snapshot written");
    }

    fn on_tick(&mut self, ev: TickEvent) {
        if !self.store.ingest(&ev) {
            TICKS_DROPPED.with_label_values(&["unsubscribed"]).inc();
            debug!(code = %ev.code, "dropping tick for unsubscribed code");
            return;
        }
        TICKS.inc();
        TICKS_BY_CODE.with_label_values(&[&ev.code]).inc();
        if let Some(series) = self.store.series(&ev.code) {
            SERIES_LEN.with_label_values(&[&ev.code]).set(series.len() as i64);
        }
        if let Some(tx) = &self.journal_tx {
            match tx.try_send(ev) {
                Ok(()) => {}
                Err(TrySendError::Full(ev)) => {
                    TICKS_DROPPED.with_label_values(&["journal_full"]).inc();
                    debug!(code = %ev.code, "journal queue full, line skipped");
                }
                Err(TrySendError::Closed(ev)) => {
                    TICKS_DROPPED.with_label_values(&["journal_closed"]).inc();
                    debug!(code = %ev.code, "journal writer gone, line skipped");
                }
            }
        }
    }

    fn flush(&mut self) {
        // one write at a time; the dirty flag stays set meanwhile
        if self.flush_in_flight || !self.store.take_dirty() {
            return;
        }
        let snap = self.store.snapshot(self.now());
        let persist = self.persist.clone();
        let done = self.flushed_tx.clone();
        self.flush_in_flight = true;
        tokio::spawn(async move {
            let saved = persist.save(&snap).await;
            let _ = done.send(saved).await;
        });
    }

    fn on_flushed(&mut self, saved: bool) {
        self.flush_in_flight = false;
        if !saved {
            self.store.mark_dirty();
            warn!("no snapshot tier accepted the write, retrying next flush");
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { code, reply } => {
                self.registry.subscribe(&self.store, &code, reply);
            }
            Command::Unsubscribe { code, reply } => {
                let res = self.registry.unsubscribe(&mut self.store, &code);
                let _ = reply.send(res);
            }
            Command::UnsubscribeAll { reply } => {
                self.registry.unsubscribe_all(&mut self.store);
                let _ = reply.send(());
            }
            Command::SetFilter { codes, reply } => {
                let _ = reply.send(self.store.set_filter(codes));
            }
            Command::View { interval, reply } => {
                let _ = reply.send(render::build_view(&self.store, interval, self.now()));
            }
            Command::Series { code, reply } => {
                let _ = reply.send(self.store.series(&code).map(<[MinuteBucket]>::to_vec));
            }
            Command::Status { reply } => {
                let _ = reply.send(StatusView {
                    conn: self.registry.current_status(),
                    codes: self
                        .store
                        .codes()
                        .iter()
                        .map(|c| {
                            let len = self.store.series(c).map_or(0, <[MinuteBucket]>::len);
                            (c.clone(), self.store.name(c).to_string(), len)
                        })
                        .collect(),
                    filter: self.store.filter().to_vec(),
                    dirty: self.store.is_dirty() || self.flush_in_flight,
                });
            }
            Command::Export { path, reply } => {
                let snap = self.store.snapshot(self.now());
                tokio::spawn(async move {
                    let res = persist::export_to(&path, &snap).await.map(|()| snap.bucket_count());
                    match &res {
                        Ok(n) => info!(path = %path.display(), buckets = n, "exported snapshot"),
                        Err(e) => warn!(path = %path.display(), error = %e, "export failed"),
                    }
                    let _ = reply.send(res);
                });
            }
            Command::Import { mut snapshot, reply } => {
                let dropped = retain_day(&mut snapshot, day_start(self.now()));
                self.registry.unsubscribe_all(&mut self.store);
                self.store.load_snapshot(snapshot);
                self.store.mark_dirty();
                self.registry.resume(&self.store);
                self.refresh_series_metrics();
                let kept: usize = self
                    .store
                    .codes()
                    .iter()
                    .filter_map(|c| self.store.series(c))
                    .map(<[MinuteBucket]>::len)
                    .sum();
                info!(codes = self.store.codes().len(), buckets = kept, dropped, "imported snapshot");
                let _ = reply.send(Ok(kept));
            }
        }
    }

    fn refresh_series_metrics(&self) {
        for code in self.store.codes() {
            let len = self.store.series(code).map_or(0, <[MinuteBucket]>::len);
            SERIES_LEN.with_label_values(&[code.as_str()]).set(len as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{GatewayUpstream, MockUpstream};
    use crate::persist::SnapshotTier;
    use crate::store::tests::{kst, tick};
    use chrono::{Duration as ChronoDuration, Timelike};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pt-engine-{}", rand::random::<u64>()))
    }

    fn file_tiers(dir: &Path) -> PersistManager {
        PersistManager::new(
            SnapshotTier::File { path: dir.join("durable.json") },
            SnapshotTier::File { path: dir.join("fallback.json") },
        )
    }

    fn start(
        upstream: Upstream,
        persist: PersistManager,
        journal_tx: Option<mpsc::Sender<TickEvent>>,
        flush_every: Duration,
    ) -> (EngineHandle, watch::Sender<bool>, JoinHandle<()>) {
        let (engine, handle) = Engine::new(
            SeriesStore::new(1000),
            upstream,
            persist,
            journal_tx,
            EngineCfg { flush_every, offset: kst() },
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));
        (handle, stop_tx, task)
    }

    fn spawn_engine(dir: &Path) -> (EngineHandle, watch::Sender<bool>, JoinHandle<()>) {
        start(
            Upstream::Mock(MockUpstream::new(None, kst())),
            file_tiers(dir),
            None,
            Duration::from_secs(3600),
        )
    }

    fn gateway(rest: &str, ws: &str) -> Upstream {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .no_proxy()
            .build()
            .unwrap();
        Upstream::Gateway(GatewayUpstream::new(http, rest, ws, kst()))
    }

    /// Accepts connections and never answers.
    async fn silent_listener() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        (format!("http://{addr}"), task)
    }

    /// Minimal REST side of the gateway: every POST is a successful subscribe.
    async fn accepting_gateway() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                            continue;
                        };
                        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                        let body_len = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if buf.len() >= end + 4 + body_len {
                            break;
                        }
                    }
                    let body = r#"{"success":true,"stock_name":"테스트"}"#;
                    let rsp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(rsp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    /// WS endpoint that drops every connection before the handshake.
    async fn dead_ws() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(sock);
            }
        });
        (format!("ws://{addr}/ws"), accepted)
    }

    async fn wait_for<F: FnMut(&StatusView) -> bool>(handle: &EngineHandle, mut cond: F) -> StatusView {
        for _ in 0..100 {
            let st = handle.status().await.unwrap();
            if cond(&st) {
                return st;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 5s");
    }

    /// "now" truncated to a minute in the market offset, safely inside today.
    fn this_minute() -> DateTime<FixedOffset> {
        let now = Utc::now().with_timezone(&kst());
        let t = now.with_second(15).unwrap().with_nanosecond(0).unwrap();
        if t.hour() == 23 && t.minute() == 59 {
            t - ChronoDuration::minutes(1)
        } else {
            t
        }
    }

    #[tokio::test]
    async fn test_subscribe_ingest_and_view() {
        let dir = temp_dir();
        let (handle, stop, task) = spawn_engine(&dir);

        assert_eq!(handle.subscribe("005930").await.unwrap(), "삼성전자");
        assert!(matches!(
            handle.subscribe("005930").await,
            Err(FlowError::AlreadySubscribed(_))
        ));

        let t = this_minute();
        let ticks = handle.ticks();
        ticks.send(tick("005930", t, 500_000, 120)).await.unwrap();
        ticks.send(tick("005930", t + ChronoDuration::seconds(30), 520_000, 120)).await.unwrap();

        let series = handle.series("005930").await.unwrap().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].net_value, 520_000);

        let view = handle.view(Interval::M1).await.unwrap();
        assert_eq!(view.table.len(), 1);
        assert_eq!(view.chart.len(), 2);
        assert_eq!(view.table[0].net_value, 520_000);

        let status = handle.status().await.unwrap();
        assert_eq!(status.codes, vec![("005930".to_string(), "삼성전자".to_string(), 1)]);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_late_ticks() {
        let dir = temp_dir();
        let (handle, stop, task) = spawn_engine(&dir);
        handle.subscribe("000660").await.unwrap();
        handle.unsubscribe("000660").await.unwrap();
        handle.ticks().send(tick("000660", this_minute(), 1, 1)).await.unwrap();
        assert!(handle.series("000660").await.unwrap().is_none());
        assert!(matches!(
            handle.unsubscribe("000660").await,
            Err(FlowError::NotSubscribed(_))
        ));
        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_shutdown_writes_snapshot_that_restores() {
        let dir = temp_dir();
        let (handle, stop, task) = spawn_engine(&dir);
        handle.subscribe("005930").await.unwrap();
        handle.ticks().send(tick("005930", this_minute(), 42, 4)).await.unwrap();
        handle.status().await.unwrap();
        stop.send(true).unwrap();
        task.await.unwrap();

        let persist = PersistManager::new(
            SnapshotTier::File { path: dir.join("durable.json") },
            SnapshotTier::File { path: dir.join("fallback.json") },
        );
        let (mut engine, handle) = Engine::new(
            SeriesStore::new(1000),
            Upstream::Mock(MockUpstream::new(None, kst())),
            persist,
            None,
            EngineCfg { flush_every: Duration::from_secs(3600), offset: kst() },
        );
        assert!(engine.restore().await);
        engine.resume();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        let series = handle.series("005930").await.unwrap().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].net_value, 42);
        assert!(matches!(
            handle.subscribe("005930").await,
            Err(FlowError::AlreadySubscribed(_))
        ));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_import_replaces_live_state() {
        let dir = temp_dir();
        let (handle, stop, task) = spawn_engine(&dir);
        handle.subscribe("005930").await.unwrap();

        let mut other = SeriesStore::new(1000);
        other.add_code("035420", "NAVER").unwrap();
        other.ingest(&tick("035420", this_minute(), 9, 9));
        let imported = handle.import(other.snapshot(this_minute())).await.unwrap();
        assert_eq!(imported, 1);

        let status = handle.status().await.unwrap();
        assert_eq!(status.codes.len(), 1);
        assert_eq!(status.codes[0].0, "035420");
        assert!(status.dirty);
        assert!(handle.series("005930").await.unwrap().is_none());

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_reads_not_blocked_by_pending_subscribe() {
        let dir = temp_dir();
        let (rest, _gw) = silent_listener().await;
        let (handle, stop, task) = start(
            gateway(&rest, "ws://127.0.0.1:9/ws"),
            file_tiers(&dir),
            None,
            Duration::from_secs(3600),
        );

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.subscribe("005930").await })
        };
        wait_for(&handle, |st| st.conn == ConnStatus::Subscribing).await;

        let started = Instant::now();
        handle.view(Interval::M1).await.unwrap();
        handle.series("005930").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "reads waited {:?}", started.elapsed());

        assert!(matches!(
            handle.subscribe("005930").await,
            Err(FlowError::AlreadySubscribed(_))
        ));

        // client timeout ends the broker call
        assert!(matches!(pending.await.unwrap(), Err(FlowError::Upstream(_))));
        let st = handle.status().await.unwrap();
        assert!(st.codes.is_empty());
        assert_eq!(st.conn, ConnStatus::Idle);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_timer_flush_writes_and_clears_dirty() {
        let dir = temp_dir();
        let (handle, stop, task) = start(
            Upstream::Mock(MockUpstream::new(None, kst())),
            file_tiers(&dir),
            None,
            Duration::from_millis(100),
        );
        handle.subscribe("005930").await.unwrap();
        handle.ticks().send(tick("005930", this_minute(), 77, 7)).await.unwrap();

        wait_for(&handle, |st| !st.dirty && st.codes.first().is_some_and(|c| c.2 == 1)).await;
        let saved = std::fs::read_to_string(dir.join("durable.json")).unwrap();
        assert!(saved.contains("005930"));
        assert!(dir.join("fallback.json").exists());

        // nothing changed: the next flushes must not touch the files
        std::fs::remove_file(dir.join("durable.json")).unwrap();
        std::fs::remove_file(dir.join("fallback.json")).unwrap();
        sleep(Duration::from_millis(400)).await;
        assert!(!dir.join("durable.json").exists());
        assert!(!dir.join("fallback.json").exists());
        assert!(!handle.status().await.unwrap().dirty);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_dirty() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let (handle, stop, task) = start(
            Upstream::Mock(MockUpstream::new(None, kst())),
            file_tiers(&blocker),
            None,
            Duration::from_millis(200),
        );
        handle.subscribe("005930").await.unwrap();
        sleep(Duration::from_millis(700)).await;
        assert!(handle.status().await.unwrap().dirty);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_full_journal_queue_counts_drops() {
        let dir = temp_dir();
        let (journal_tx, _journal_rx) = mpsc::channel::<TickEvent>(1);
        let (handle, stop, task) = start(
            Upstream::Mock(MockUpstream::new(None, kst())),
            file_tiers(&dir),
            Some(journal_tx),
            Duration::from_secs(3600),
        );
        let before = TICKS_DROPPED.with_label_values(&["journal_full"]).get();
        handle.subscribe("005930").await.unwrap();
        let t = this_minute();
        handle.ticks().send(tick("005930", t, 1, 1)).await.unwrap();
        handle.ticks().send(tick("005930", t, 2, 2)).await.unwrap();
        // both ticks still reach the store
        assert_eq!(handle.series("005930").await.unwrap().unwrap()[0].net_value, 2);
        assert!(TICKS_DROPPED.with_label_values(&["journal_full"]).get() > before);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_lost_stream_reopens_on_next_subscribe_only() {
        let dir = temp_dir();
        let rest = accepting_gateway().await;
        let (ws, accepted) = dead_ws().await;
        let (handle, stop, task) = start(
            gateway(&rest, &ws),
            file_tiers(&dir),
            None,
            Duration::from_secs(3600),
        );

        assert_eq!(handle.subscribe("005930").await.unwrap(), "테스트");
        wait_for(&handle, |st| st.conn == ConnStatus::Lost).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status().await.unwrap().conn, ConnStatus::Lost);

        handle.subscribe("000660").await.unwrap();
        for _ in 0..100 {
            if accepted.load(Ordering::SeqCst) >= 2 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        let st = wait_for(&handle, |st| st.conn == ConnStatus::Lost).await;
        assert_eq!(st.codes.len(), 2);

        stop.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
