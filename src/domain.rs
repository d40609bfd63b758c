// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// One validated program-trading tick. Values are cumulative for the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    pub code: String,
    pub ts: DateTime<FixedOffset>,
    pub net_value: i64,
    pub net_volume: i64,
    pub price: i64,
    pub rate: f64,
    pub sign: u8,
    pub sell_volume: i64,
    pub buy_volume: i64,
    pub sell_remainder: i64,
    pub buy_remainder: i64,
}

/// Canonical one-minute unit. `minute_start` keeps the market offset so the
/// resampler can align windows to minute-of-day without extra context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteBucket {
    pub minute_start: DateTime<FixedOffset>,
    pub net_value: i64,
    pub net_volume: i64,
    pub price: i64,
    pub rate: f64,
    pub sign: u8,
    pub sell_volume: i64,
    pub buy_volume: i64,
    pub sell_remainder: i64,
    pub buy_remainder: i64,
}

impl MinuteBucket {
    pub fn from_tick(ev: &TickEvent, minute_start: DateTime<FixedOffset>) -> Self {
        let mut b = MinuteBucket {
            minute_start,
            net_value: 0,
            net_volume: 0,
            price: 0,
            rate: 0.0,
            sign: 0,
            sell_volume: 0,
            buy_volume: 0,
            sell_remainder: 0,
            buy_remainder: 0,
        };
        b.overwrite(ev);
        b
    }

    /// Last-write-wins: every field except the key comes from `ev`.
    pub fn overwrite(&mut self, ev: &TickEvent) {
        self.net_value = ev.net_value;
        self.net_volume = ev.net_volume;
        self.price = ev.price;
        self.rate = ev.rate;
        self.sign = ev.sign;
        self.sell_volume = ev.sell_volume;
        self.buy_volume = ev.buy_volume;
        self.sell_remainder = ev.sell_remainder;
        self.buy_remainder = ev.buy_remainder;
    }

    pub fn at(&self, minute_start: DateTime<FixedOffset>) -> Self {
        MinuteBucket { minute_start, ..self.clone() }
    }
}

/// Interchange shape for the durable tier, the fallback tier and manual export/import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub chart_data: BTreeMap<String, Vec<MinuteBucket>>,
    pub subscribed_codes: Vec<String>,
    pub code_name_map: BTreeMap<String, String>,
    #[serde(default)]
    pub saved_at: Option<String>,
}

impl Snapshot {
    pub fn bucket_count(&self) -> usize {
        self.chart_data.values().map(Vec::len).sum()
    }
}

/// Connection state shown by the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Subscribing,
    Connected,
    Lost,
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnStatus::Idle => "idle",
            ConnStatus::Subscribing => "subscribing",
            ConnStatus::Connected => "connected",
            ConnStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}
