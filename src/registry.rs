// ===============================
// src/registry.rs (Subscription Registry)
// ===============================
//
// Owns the broker side of subscriptions and the one shared event stream:
// - first subscribe opens the stream, last unsubscribe closes it
// - unsubscribe removes the code from the store *before* talking to the
//   broker, so late ticks are dropped even if the ack never arrives
// - no auto-reconnect: a lost stream is replaced on the next subscribe/resume
//
// Broker REST calls never run on the engine loop. They are queued to
// `run_upstream`, which executes them one by one (so a quick unsub/sub pair
// reaches the broker in order) and posts subscribe results back as
// `UpstreamDone`. The engine then calls `complete` to commit them.
//
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::domain::{ConnStatus, TickEvent};
use crate::error::FlowError;
use crate::feed::{StatusTx, StreamHandle, Upstream};
use crate::metrics::{SERIES_LEN, SUBSCRIBED_CODES};
use crate::store::SeriesStore;

pub type SubscribeReply = oneshot::Sender<Result<String, FlowError>>;

/// Who is waiting for a subscribe result.
pub enum SubKind {
    /// user request; committed to the store on success
    New(SubscribeReply),
    /// re-issue for a code already restored into the store
    Resume,
}

pub enum UpstreamCall {
    Subscribe { code: String, kind: SubKind },
    /// `None` means "all codes".
    Unsubscribe { code: Option<String> },
}

pub struct UpstreamDone {
    pub code: String,
    pub kind: SubKind,
    pub result: Result<String, FlowError>,
}

/// Sequential broker worker. Ends when the registry drops its sender.
pub async fn run_upstream(
    upstream: Arc<Upstream>,
    mut calls: mpsc::UnboundedReceiver<UpstreamCall>,
    done_tx: mpsc::Sender<UpstreamDone>,
) {
    while let Some(call) = calls.recv().await {
        match call {
            UpstreamCall::Subscribe { code, kind } => {
                let result = upstream.subscribe(&code).await;
                if done_tx.send(UpstreamDone { code, kind, result }).await.is_err() {
                    return;
                }
            }
            UpstreamCall::Unsubscribe { code } => {
                if let Err(e) = upstream.unsubscribe(code.as_deref()).await {
                    match code {
                        Some(c) => warn!(code = %c, error = %e, "upstream unsubscribe failed, ticks are dropped locally"),
                        None => warn!(error = %e, "upstream unsubscribe-all failed"),
                    }
                }
            }
        }
    }
    debug!("upstream worker stopped");
}

pub struct Registry {
    upstream: Arc<Upstream>,
    calls: mpsc::UnboundedSender<UpstreamCall>,
    tick_tx: mpsc::Sender<TickEvent>,
    status_tx: StatusTx,
    stream: Option<StreamHandle>,
    /// user subscribes sent to the broker and not yet answered
    pending: HashSet<String>,
}

impl Registry {
    /// Spawns the upstream worker. Results arrive on the returned receiver
    /// and must be handed to `complete`.
    pub fn new(upstream: Upstream, tick_tx: mpsc::Sender<TickEvent>) -> (Self, mpsc::Receiver<UpstreamDone>) {
        let (status_tx, _rx) = watch::channel(ConnStatus::Idle);
        let (calls, calls_rx) = mpsc::unbounded_channel::<UpstreamCall>();
        let (done_tx, done_rx) = mpsc::channel::<UpstreamDone>(256);
        let upstream = Arc::new(upstream);
        tokio::spawn(run_upstream(Arc::clone(&upstream), calls_rx, done_tx));
        let registry = Self {
            upstream,
            calls,
            tick_tx,
            status_tx: Arc::new(status_tx),
            stream: None,
            pending: HashSet::new(),
        };
        (registry, done_rx)
    }

    pub fn status(&self) -> watch::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnStatus {
        *self.status_tx.borrow()
    }

    pub fn stream_open(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| !s.is_finished())
    }

    #[cfg(test)]
    pub fn is_pending(&self, code: &str) -> bool {
        self.pending.contains(code)
    }

    /// Queues the broker call. The reply is sent from `complete`, or right
    /// away when the code is already live or pending.
    pub fn subscribe(&mut self, store: &SeriesStore, code: &str, reply: SubscribeReply) {
        if store.is_subscribed(code) || self.pending.contains(code) {
            let _ = reply.send(Err(FlowError::AlreadySubscribed(code.to_string())));
            return;
        }
        self.pending.insert(code.to_string());
        self.status_tx.send_replace(ConnStatus::Subscribing);
        let call = UpstreamCall::Subscribe {
            code: code.to_string(),
            kind: SubKind::New(reply),
        };
        if let Err(mpsc::error::SendError(UpstreamCall::Subscribe { kind: SubKind::New(reply), .. })) =
            self.calls.send(call)
        {
            self.pending.remove(code);
            self.settle_status();
            let _ = reply.send(Err(FlowError::Upstream("upstream worker stopped".into())));
        }
    }

    /// Commits a broker answer to the store.
    pub fn complete(&mut self, store: &mut SeriesStore, done: UpstreamDone) {
        let UpstreamDone { code, kind, result } = done;
        match kind {
            SubKind::Resume => {
                match result {
                    Ok(_) => debug!(%code, "re-subscribed"),
                    Err(e) => warn!(%code, error = %e, "re-subscribe failed, keeping restored data"),
                }
                self.settle_status();
            }
            SubKind::New(reply) => {
                let res = if !self.pending.remove(&code) {
                    // a `stop` was queued after this call; the broker side is undone by it
                    Err(FlowError::Upstream(format!("subscribe {code} cancelled")))
                } else {
                    result.and_then(|name| store.add_code(&code, &name))
                };
                match &res {
                    Ok(()) => {
                        self.ensure_stream();
                        SUBSCRIBED_CODES.set(store.codes().len() as i64);
                        info!(%code, name = %store.name(&code), "subscribed");
                    }
                    Err(e) => {
                        warn!(%code, error = %e, "subscribe failed");
                        self.settle_status();
                    }
                }
                let _ = reply.send(res.map(|()| store.name(&code).to_string()));
            }
        }
    }

    /// Local removal is immediate; the broker is told afterwards.
    pub fn unsubscribe(&mut self, store: &mut SeriesStore, code: &str) -> Result<(), FlowError> {
        if !store.remove_code(code) {
            return Err(FlowError::NotSubscribed(code.to_string()));
        }
        let _ = SERIES_LEN.remove_label_values(&[code]);
        SUBSCRIBED_CODES.set(store.codes().len() as i64);
        self.queue(UpstreamCall::Unsubscribe { code: Some(code.to_string()) });
        if store.is_empty() {
            self.close_stream();
        }
        info!(%code, "unsubscribed");
        Ok(())
    }

    /// Clears all state and tears the stream down, whatever the broker says.
    pub fn unsubscribe_all(&mut self, store: &mut SeriesStore) {
        for code in store.codes() {
            let _ = SERIES_LEN.remove_label_values(&[code.as_str()]);
        }
        store.clear();
        self.pending.clear();
        SUBSCRIBED_CODES.set(0);
        self.queue(UpstreamCall::Unsubscribe { code: None });
        self.close_stream();
        info!("all subscriptions stopped");
    }

    /// Re-issue broker subscriptions for codes that are already in the store
    /// (after restore/import). One failing code does not stop the others.
    pub fn resume(&mut self, store: &SeriesStore) {
        if store.is_empty() {
            return;
        }
        self.status_tx.send_replace(ConnStatus::Subscribing);
        for code in store.codes() {
            self.queue(UpstreamCall::Subscribe {
                code: code.clone(),
                kind: SubKind::Resume,
            });
        }
        self.ensure_stream();
        SUBSCRIBED_CODES.set(store.codes().len() as i64);
        info!(total = store.codes().len(), "re-subscribing restored codes");
    }

    fn queue(&self, call: UpstreamCall) {
        if self.calls.send(call).is_err() {
            warn!("upstream worker stopped, broker call skipped");
        }
    }

    /// Leaves `Subscribing` once nothing is in flight.
    fn settle_status(&self) {
        if self.pending.is_empty() && self.current_status() == ConnStatus::Subscribing {
            let next = if self.stream_open() {
                ConnStatus::Connected
            } else {
                ConnStatus::Idle
            };
            self.status_tx.send_replace(next);
        }
    }

    fn ensure_stream(&mut self) {
        if self.stream_open() {
            if self.pending.is_empty() && self.current_status() == ConnStatus::Subscribing {
                self.status_tx.send_replace(ConnStatus::Connected);
            }
            return;
        }
        if let Some(stale) = self.stream.take() {
            stale.close();
        }
        info!("opening shared event stream");
        self.stream = Some(
            self.upstream
                .open_stream(self.tick_tx.clone(), Arc::clone(&self.status_tx)),
        );
    }

    fn close_stream(&mut self) {
        if let Some(handle) = self.stream.take() {
            handle.close();
            info!("shared event stream closed");
        }
        self.status_tx.send_replace(ConnStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MockUpstream;
    use crate::store::tests::kst;

    struct Harness {
        reg: Registry,
        done_rx: mpsc::Receiver<UpstreamDone>,
        store: SeriesStore,
        _ticks: mpsc::Receiver<TickEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(16);
            let (reg, done_rx) = Registry::new(Upstream::Mock(MockUpstream::new(None, kst())), tx);
            Harness { reg, done_rx, store: SeriesStore::new(1000), _ticks: rx }
        }

        /// Subscribe and drive the broker answer through `complete`.
        async fn subscribe(&mut self, code: &str) -> Result<String, FlowError> {
            let (tx, mut rx) = oneshot::channel();
            self.reg.subscribe(&self.store, code, tx);
            if let Ok(res) = rx.try_recv() {
                return res;
            }
            let done = self.done_rx.recv().await.unwrap();
            self.reg.complete(&mut self.store, done);
            rx.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_subscribe_opens_last_unsubscribe_closes() {
        let mut h = Harness::new();
        assert!(!h.reg.stream_open());

        assert_eq!(h.subscribe("005930").await.unwrap(), "삼성전자");
        assert!(h.reg.stream_open());
        h.subscribe("000660").await.unwrap();
        assert!(h.reg.stream_open());

        h.reg.unsubscribe(&mut h.store, "005930").unwrap();
        assert!(h.reg.stream_open());
        h.reg.unsubscribe(&mut h.store, "000660").unwrap();
        assert!(!h.reg.stream_open());
        assert_eq!(h.reg.current_status(), ConnStatus::Idle);
    }

    #[tokio::test]
    async fn test_store_untouched_until_broker_answers() {
        let mut h = Harness::new();
        let (tx, mut rx) = oneshot::channel();
        h.reg.subscribe(&h.store, "005930", tx);
        assert!(h.reg.is_pending("005930"));
        assert!(!h.store.is_subscribed("005930"));
        assert_eq!(h.reg.current_status(), ConnStatus::Subscribing);

        // second request while the first is in flight
        assert!(matches!(
            h.subscribe("005930").await,
            Err(FlowError::AlreadySubscribed(_))
        ));

        let done = h.done_rx.recv().await.unwrap();
        h.reg.complete(&mut h.store, done);
        assert_eq!(rx.try_recv().unwrap().unwrap(), "삼성전자");
        assert!(h.store.is_subscribed("005930"));
        assert!(!h.reg.is_pending("005930"));
    }

    #[tokio::test]
    async fn test_status_reaches_connected() {
        let mut h = Harness::new();
        let mut status = h.reg.status();
        h.subscribe("005930").await.unwrap();
        while *status.borrow_and_update() != ConnStatus::Connected {
            status.changed().await.unwrap();
        }
        assert_eq!(h.reg.current_status(), ConnStatus::Connected);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_state_untouched() {
        let mut h = Harness::new();
        let err = h.subscribe("bad code").await.unwrap_err();
        assert!(matches!(err, FlowError::Upstream(_)));
        assert!(h.store.is_empty());
        assert!(!h.reg.stream_open());
        assert_eq!(h.reg.current_status(), ConnStatus::Idle);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_subscribe() {
        let mut h = Harness::new();
        let (tx, rx) = oneshot::channel();
        h.reg.subscribe(&h.store, "005930", tx);
        h.reg.unsubscribe_all(&mut h.store);

        let done = h.done_rx.recv().await.unwrap();
        h.reg.complete(&mut h.store, done);
        assert!(matches!(rx.await.unwrap(), Err(FlowError::Upstream(_))));
        assert!(h.store.is_empty());
        assert!(!h.reg.stream_open());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown() {
        let mut h = Harness::new();
        h.subscribe("005930").await.unwrap();
        assert!(matches!(
            h.subscribe("005930").await,
            Err(FlowError::AlreadySubscribed(_))
        ));
        assert!(matches!(
            h.reg.unsubscribe(&mut h.store, "035720"),
            Err(FlowError::NotSubscribed(_))
        ));
        assert_eq!(h.store.codes().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_reopens_for_restored_codes() {
        let mut h = Harness::new();
        h.store.add_code("005930", "삼성전자").unwrap();
        h.store.add_code("bad code", "bad").unwrap();

        h.reg.resume(&h.store);
        assert!(h.reg.stream_open());
        for _ in 0..2 {
            let done = h.done_rx.recv().await.unwrap();
            h.reg.complete(&mut h.store, done);
        }
        // a code the broker rejects keeps its restored entry
        assert_eq!(h.store.codes().len(), 2);

        h.reg.unsubscribe_all(&mut h.store);
        assert!(h.store.is_empty());
        assert!(!h.reg.stream_open());
    }
}
