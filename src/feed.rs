// ===============================
// src/feed.rs
// ===============================
//
// Upstream adapters (broker side of the Subscription Registry):
// - Mock    : in-process broker, random-walk program-trading ticks per code
// - Gateway : REST subscribe/unsubscribe + one shared WS event stream
//
// Notes:
// - Every inbound payload goes through `tick_from_value`, which fails closed:
//   a missing, non-numeric or non-finite field drops the whole event.
// - A stream never reconnects by itself. On error it reports `Lost` and ends;
//   the registry opens a new one on the next subscribe/restore.
//
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use futures_util::StreamExt; // for .next()
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{ConnStatus, TickEvent};
use crate::error::FlowError;
use crate::metrics::TICKS_DROPPED;

pub type StatusTx = Arc<watch::Sender<ConnStatus>>;

/// Running shared event connection.
#[derive(Debug)]
pub struct StreamHandle {
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

pub enum Upstream {
    Mock(MockUpstream),
    Gateway(GatewayUpstream),
}

impl Upstream {
    /// Returns the resolved display name.
    pub async fn subscribe(&self, code: &str) -> Result<String, FlowError> {
        match self {
            Upstream::Mock(m) => m.subscribe(code),
            Upstream::Gateway(g) => g.subscribe(code).await,
        }
    }

    /// `None` means "all codes".
    pub async fn unsubscribe(&self, code: Option<&str>) -> Result<(), FlowError> {
        match self {
            Upstream::Mock(m) => {
                m.unsubscribe(code);
                Ok(())
            }
            Upstream::Gateway(g) => g.unsubscribe(code).await,
        }
    }

    pub fn open_stream(&self, tick_tx: mpsc::Sender<TickEvent>, status_tx: StatusTx) -> StreamHandle {
        let task = match self {
            Upstream::Mock(m) => tokio::spawn(run_mock(
                m.codes.subscribe(),
                tick_tx,
                status_tx,
                m.tick_every,
                m.offset,
            )),
            Upstream::Gateway(g) => tokio::spawn(run_gateway_stream(
                g.ws_url.clone(),
                tick_tx,
                status_tx,
                g.offset,
            )),
        };
        StreamHandle { task }
    }
}

// -----------------------------------------------------------------------------
// Mock broker
// -----------------------------------------------------------------------------

/// `tick_every = None` gives a silent stream (connected, never ticks).
pub struct MockUpstream {
    codes: watch::Sender<BTreeSet<String>>,
    tick_every: Option<Duration>,
    offset: FixedOffset,
}

impl MockUpstream {
    pub fn new(tick_every: Option<Duration>, offset: FixedOffset) -> Self {
        let (codes, _rx) = watch::channel(BTreeSet::new());
        Self { codes, tick_every, offset }
    }

    fn subscribe(&self, code: &str) -> Result<String, FlowError> {
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FlowError::Upstream(format!("unknown code {code:?}")));
        }
        self.codes.send_modify(|s| {
            s.insert(code.to_string());
        });
        Ok(mock_name(code).to_string())
    }

    fn unsubscribe(&self, code: Option<&str>) {
        self.codes.send_modify(|s| match code {
            Some(c) => {
                s.remove(c);
            }
            None => s.clear(),
        });
    }
}

fn mock_name(code: &str) -> &str {
    match code {
        "005930" => "삼성전자",
        "000660" => "SK하이닉스",
        "373220" => "LG에너지솔루션",
        "005380" => "현대차",
        "035420" => "NAVER",
        "035720" => "카카오",
        _ => code,
    }
}

/// Cumulative state of one mock instrument.
struct MockWalk {
    base: i64,
    price: i64,
    net_value: i64,
    net_volume: i64,
    sell_volume: i64,
    buy_volume: i64,
}

impl MockWalk {
    fn new(rng: &mut impl Rng) -> Self {
        let base = rng.gen_range(200..=2_000) * 100;
        Self { base, price: base, net_value: 0, net_volume: 0, sell_volume: 0, buy_volume: 0 }
    }

    fn step(&mut self, rng: &mut impl Rng, code: &str, ts: DateTime<FixedOffset>) -> TickEvent {
        let qty: i64 = rng.gen_range(-500..=600);
        if qty < 0 {
            self.sell_volume += -qty;
        } else {
            self.buy_volume += qty;
        }
        self.net_volume += qty;
        self.net_value += qty * self.price;
        self.price = (self.price + rng.gen_range(-3..=3) * 100).max(100);

        let diff = self.price - self.base;
        let rate = ((diff as f64) * 10_000.0 / (self.base as f64)).round() / 100.0;
        let sign = match diff.signum() {
            1 => 2,
            0 => 3,
            _ => 5,
        };
        TickEvent {
            code: code.to_string(),
            ts,
            net_value: self.net_value,
            net_volume: self.net_volume,
            price: self.price,
            rate,
            sign,
            sell_volume: self.sell_volume,
            buy_volume: self.buy_volume,
            sell_remainder: rng.gen_range(1_000..=50_000),
            buy_remainder: rng.gen_range(1_000..=50_000),
        }
    }
}

async fn run_mock(
    codes: watch::Receiver<BTreeSet<String>>,
    tick_tx: mpsc::Sender<TickEvent>,
    status_tx: StatusTx,
    tick_every: Option<Duration>,
    offset: FixedOffset,
) {
    status_tx.send_replace(ConnStatus::Connected);
    info!("mock event stream connected");
    let Some(every) = tick_every else {
        return std::future::pending().await;
    };

    let mut walks: HashMap<String, MockWalk> = HashMap::new();
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let now = Utc::now().with_timezone(&offset);
        // jangan simpan ThreadRng / watch guard melewati .await
        let batch: Vec<TickEvent> = {
            let codes = codes.borrow();
            let mut rng = rand::thread_rng();
            walks.retain(|c, _| codes.contains(c));
            codes
                .iter()
                .map(|code| {
                    walks
                        .entry(code.clone())
                        .or_insert_with(|| MockWalk::new(&mut rng))
                        .step(&mut rng, code, now)
                })
                .collect()
        };
        for ev in batch {
            if tick_tx.send(ev).await.is_err() {
                return;
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Gateway broker (REST + WS)
// -----------------------------------------------------------------------------

pub struct GatewayUpstream {
    http: reqwest::Client,
    rest_base: String,
    ws_url: String,
    offset: FixedOffset,
}

#[derive(Debug, Deserialize)]
struct SubscribeRsp {
    success: bool,
    #[serde(default)]
    stock_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckRsp {
    #[serde(default)]
    success: bool,
}

impl GatewayUpstream {
    pub fn new(http: reqwest::Client, rest_base: &str, ws_url: &str, offset: FixedOffset) -> Self {
        Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            offset,
        }
    }

    async fn subscribe(&self, code: &str) -> Result<String, FlowError> {
        let url = format!("{}/program-trading/subscribe", self.rest_base);
        let rsp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?;
        if !rsp.status().is_success() {
            let status = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(FlowError::Upstream(format!("subscribe {code}: {status} {body}")));
        }
        let body = rsp.json::<SubscribeRsp>().await?;
        if !body.success {
            return Err(FlowError::Upstream(format!("subscribe {code}: rejected")));
        }
        Ok(body.stock_name.unwrap_or_default())
    }

    async fn unsubscribe(&self, code: Option<&str>) -> Result<(), FlowError> {
        let url = format!("{}/program-trading/unsubscribe", self.rest_base);
        let body = match code {
            Some(c) => serde_json::json!({ "code": c }),
            None => serde_json::json!({}),
        };
        let rsp = self.http.post(url).json(&body).send().await?;
        let ack = rsp.error_for_status()?.json::<AckRsp>().await?;
        if !ack.success {
            return Err(FlowError::Upstream("unsubscribe not acknowledged".into()));
        }
        Ok(())
    }
}

async fn run_gateway_stream(
    ws_url: String,
    tick_tx: mpsc::Sender<TickEvent>,
    status_tx: StatusTx,
    offset: FixedOffset,
) {
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            status_tx.send_replace(ConnStatus::Lost);
            return;
        }
    };

    info!(%ws_url, "connecting program-trading stream");
    match connect_async(url.as_str()).await {
        Ok((mut ws, _resp)) => {
            status_tx.send_replace(ConnStatus::Connected);
            info!("program-trading stream connected");
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(m) if m.is_text() => {
                        let txt = match m.into_text() {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(?e, "failed to read text frame");
                                continue;
                            }
                        };
                        let now = Utc::now().with_timezone(&offset);
                        match parse_tick(&txt, now) {
                            Some(ev) => {
                                if tick_tx.send(ev).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                TICKS_DROPPED.with_label_values(&["malformed"]).inc();
                                debug!(frame = %txt, "dropping malformed tick");
                            }
                        }
                    }
                    Ok(m) if m.is_close() => break,
                    Ok(_) => {
                        // ping/pong/binary
                    }
                    Err(e) => {
                        error!(?e, "ws read error");
                        break;
                    }
                }
            }
            warn!("program-trading stream disconnected");
        }
        Err(e) => {
            error!(?e, "connect failed");
        }
    }
    status_tx.send_replace(ConnStatus::Lost);
}

// -----------------------------------------------------------------------------
// Validated tick construction
// -----------------------------------------------------------------------------

pub fn parse_tick(txt: &str, now: DateTime<FixedOffset>) -> Option<TickEvent> {
    let v: Value = serde_json::from_str(txt).ok()?;
    tick_from_value(&v, now)
}

/// `now` supplies the market date and offset for `HHMMSS` times.
pub fn tick_from_value(v: &Value, now: DateTime<FixedOffset>) -> Option<TickEvent> {
    let code = match field(v, &["code", "MKSC_SHRN_ISCD"])? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return None,
    };
    let sign = u8::try_from(int_field(v, &["sign", "PRDY_VRSS_SIGN"])?).ok()?;
    if !(1..=5).contains(&sign) {
        return None;
    }
    Some(TickEvent {
        code,
        ts: timestamp(v, now)?,
        net_value: int_field(v, &["net_value", "NTBY_TR_PBMN"])?,
        net_volume: int_field(v, &["net_volume", "WHOL_NTBY_QTY"])?,
        price: int_field(v, &["price", "STCK_PRPR"])?,
        rate: float_field(v, &["rate", "PRDY_CTRT"])?,
        sign,
        sell_volume: int_field(v, &["sell_volume", "SELN_CNQN"])?,
        buy_volume: int_field(v, &["buy_volume", "SHNU_CNQN"])?,
        sell_remainder: int_field(v, &["sell_remainder", "SELN_RSQN"])?,
        buy_remainder: int_field(v, &["buy_remainder", "SHNU_RSQN"])?,
    })
}

fn field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| v.get(*k)).filter(|x| !x.is_null())
}

fn float_field(v: &Value, keys: &[&str]) -> Option<f64> {
    let f = match field(v, keys)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

fn int_field(v: &Value, keys: &[&str]) -> Option<i64> {
    if let Value::Number(n) = field(v, keys)? {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let Value::String(s) = field(v, keys)? {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    let f = float_field(v, keys)?;
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn timestamp(v: &Value, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    if let Some(Value::String(s)) = field(v, &["ts"]) {
        return DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(now.offset()));
    }
    let hms = match field(v, &["time", "STCK_CNTG_HOUR"])? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => format!("{:06}", n.as_u64()?),
        _ => return None,
    };
    let t = NaiveTime::parse_from_str(&hms, "%H%M%S").ok()?;
    now.date_naive()
        .and_time(t)
        .and_local_timezone(*now.offset())
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::at;

    fn full() -> Value {
        serde_json::json!({
            "code": "005930",
            "time": "100015",
            "net_value": 500000,
            "net_volume": "120",
            "price": "61000",
            "rate": "1.25",
            "sign": "2",
            "sell_volume": 10,
            "buy_volume": 130,
            "sell_remainder": 3000,
            "buy_remainder": 4000
        })
    }

    #[test]
    fn test_plain_tick_is_accepted() {
        let ev = tick_from_value(&full(), at(11, 0, 0)).unwrap();
        assert_eq!(ev.code, "005930");
        assert_eq!(ev.ts, at(10, 0, 15));
        assert_eq!(ev.net_value, 500_000);
        assert_eq!(ev.net_volume, 120);
        assert_eq!(ev.rate, 1.25);
        assert_eq!(ev.sign, 2);
    }

    #[test]
    fn test_broker_field_names_are_accepted() {
        let v = serde_json::json!({
            "MKSC_SHRN_ISCD": "000660",
            "STCK_CNTG_HOUR": "093001",
            "NTBY_TR_PBMN": "-1500000",
            "WHOL_NTBY_QTY": "-12",
            "STCK_PRPR": "180500",
            "PRDY_CTRT": "-0.33",
            "PRDY_VRSS_SIGN": "5",
            "SELN_CNQN": "40",
            "SHNU_CNQN": "28",
            "SELN_RSQN": "1000",
            "SHNU_RSQN": "900"
        });
        let ev = tick_from_value(&v, at(11, 0, 0)).unwrap();
        assert_eq!(ev.code, "000660");
        assert_eq!(ev.ts, at(9, 30, 1));
        assert_eq!(ev.net_value, -1_500_000);
        assert_eq!(ev.sign, 5);
    }

    #[test]
    fn test_rfc3339_timestamp_is_moved_to_market_offset() {
        let mut v = full();
        v.as_object_mut().unwrap().remove("time");
        v["ts"] = Value::from("2026-10-19T01:00:15Z");
        let ev = tick_from_value(&v, at(11, 0, 0)).unwrap();
        assert_eq!(ev.ts, at(10, 0, 15));
        assert_eq!(ev.ts.offset(), at(0, 0, 0).offset());
    }

    #[test]
    fn test_missing_or_bad_fields_fail_closed() {
        for key in ["code", "time", "net_value", "net_volume", "sign", "buy_remainder"] {
            let mut v = full();
            v.as_object_mut().unwrap().remove(key);
            assert!(tick_from_value(&v, at(11, 0, 0)).is_none(), "missing {key}");
        }
        let mut v = full();
        v["rate"] = Value::from("NaN");
        assert!(tick_from_value(&v, at(11, 0, 0)).is_none());
        let mut v = full();
        v["net_value"] = Value::from("12abc");
        assert!(tick_from_value(&v, at(11, 0, 0)).is_none());
        let mut v = full();
        v["time"] = Value::from("256199");
        assert!(tick_from_value(&v, at(11, 0, 0)).is_none());
        assert!(parse_tick("not json", at(11, 0, 0)).is_none());
    }

    #[test]
    fn test_mock_subscribe_resolves_names() {
        let mock = MockUpstream::new(None, *at(0, 0, 0).offset());
        assert_eq!(mock.subscribe("005930").unwrap(), "삼성전자");
        assert_eq!(mock.subscribe("123456").unwrap(), "123456");
        assert!(mock.subscribe("").is_err());
        assert_eq!(mock.codes.borrow().len(), 2);
        mock.unsubscribe(None);
        assert!(mock.codes.borrow().is_empty());
    }
}
