// ===============================
// src/render.rs
// ===============================
//
// Chart and table views. Both are built from the same `resample` call per
// code, so the two can never disagree about a point.
//
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone};

use crate::domain::MinuteBucket;
use crate::resample::{resample, Interval};
use crate::store::SeriesStore;

pub const PALETTE: [&str; 6] = ["#4BC0C0", "#FFB347", "#FF6384", "#36A2EB", "#9966FF", "#F2B1D0"];

pub const SESSION_OPEN: (u32, u32) = (9, 0);
pub const SESSION_CLOSE: (u32, u32) = (15, 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    NetValue,
    NetVolume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartPoint {
    /// epoch milliseconds
    pub x: i64,
    pub y: i64,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartDataset {
    pub code: String,
    pub label: String,
    pub metric: Metric,
    pub color: &'static str,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub code: String,
    pub name: String,
    pub time: DateTime<FixedOffset>,
    pub net_value: i64,
    pub net_volume: i64,
    pub price: i64,
    pub rate: f64,
    pub sign: u8,
}

#[derive(Debug, Clone)]
pub struct FlowView {
    pub interval: Interval,
    pub axis: (DateTime<FixedOffset>, DateTime<FixedOffset>),
    pub chart: Vec<ChartDataset>,
    pub table: Vec<TableRow>,
}

fn today_at(now: DateTime<FixedOffset>, (h, m): (u32, u32)) -> DateTime<FixedOffset> {
    let Some(t) = NaiveTime::from_hms_opt(h, m, 0) else {
        return now;
    };
    now.offset()
        .from_local_datetime(&now.date_naive().and_time(t))
        .single()
        .unwrap_or(now)
}

/// 09:00 to max(09:00, min(now, 15:30)) of today.
pub fn session_axis(now: DateTime<FixedOffset>) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let open = today_at(now, SESSION_OPEN);
    let close = today_at(now, SESSION_CLOSE);
    (open, now.min(close).max(open))
}

/// Korean money units: 억 (1e8) with one decimal, 만 (1e4) truncated.
pub fn format_value(v: i64) -> String {
    let abs = v.unsigned_abs();
    if abs >= 100_000_000 {
        format!("{:.1}억", v as f64 / 1e8)
    } else if abs >= 10_000 {
        format!("{}만", v / 10_000)
    } else {
        v.to_string()
    }
}

fn points(series: &[MinuteBucket], metric: Metric) -> Vec<ChartPoint> {
    series
        .iter()
        .map(|b| ChartPoint {
            x: b.minute_start.timestamp_millis(),
            y: match metric {
                Metric::NetValue => b.net_value,
                Metric::NetVolume => b.net_volume,
            },
            price: b.price,
        })
        .collect()
}

pub fn build_view(store: &SeriesStore, interval: Interval, now: DateTime<FixedOffset>) -> FlowView {
    let mut chart = Vec::new();
    let mut table = Vec::new();

    // color slot = position in the subscription set, hidden codes included
    for (slot, code) in store.codes().iter().enumerate() {
        if !store.is_visible(code) {
            continue;
        }
        let Some(canonical) = store.series(code) else {
            continue;
        };
        let series = resample(canonical, interval);
        let name = store.name(code);
        let color = PALETTE[slot % PALETTE.len()];

        chart.push(ChartDataset {
            code: code.clone(),
            label: format!("{name} (대금)"),
            metric: Metric::NetValue,
            color,
            points: points(&series, Metric::NetValue),
        });
        chart.push(ChartDataset {
            code: code.clone(),
            label: format!("{name} (수량)"),
            metric: Metric::NetVolume,
            color,
            points: points(&series, Metric::NetVolume),
        });

        table.extend(series.iter().map(|b| TableRow {
            code: code.clone(),
            name: name.to_string(),
            time: b.minute_start,
            net_value: b.net_value,
            net_volume: b.net_volume,
            price: b.price,
            rate: b.rate,
            sign: b.sign,
        }));
    }

    // newest first; stable, so codes keep subscription order within a minute
    table.sort_by(|a, b| b.time.cmp(&a.time));

    FlowView {
        interval,
        axis: session_axis(now),
        chart,
        table,
    }
}

fn sign_mark(sign: u8) -> &'static str {
    match sign {
        1 => "↑",
        2 => "▲",
        4 => "↓",
        5 => "▼",
        _ => "-",
    }
}

pub fn format_table(view: &FlowView, limit: usize) -> String {
    let mut out = format!(
        "{:<6} {:<10} {:<12} {:>10} {:>12} {:>9} {:>8}\n",
        "time", "code", "name", "net value", "net volume", "price", "rate"
    );
    for row in view.table.iter().take(limit) {
        out.push_str(&format!(
            "{:<6} {:<10} {:<12} {:>10} {:>12} {:>9} {:>1}{:>6.2}%\n",
            row.time.format("%H:%M"),
            row.code,
            row.name,
            format_value(row.net_value),
            row.net_volume,
            row.price,
            sign_mark(row.sign),
            row.rate,
        ));
    }
    if view.table.len() > limit {
        out.push_str(&format!("... {} more rows\n", view.table.len() - limit));
    }
    out
}

const SPARKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

fn sparkline(points: &[ChartPoint]) -> String {
    let (Some(lo), Some(hi)) = (
        points.iter().map(|p| p.y).min(),
        points.iter().map(|p| p.y).max(),
    ) else {
        return String::new();
    };
    let span = (hi - lo).max(1) as f64;
    points
        .iter()
        .map(|p| {
            let idx = (((p.y - lo) as f64 / span) * 7.0).round() as usize;
            SPARKS[idx.min(7)]
        })
        .collect()
}

/// Text rendition of the chart: one line per net-value dataset.
pub fn format_chart(view: &FlowView, width: usize) -> String {
    let (from, to) = view.axis;
    let mut out = format!(
        "[{}] {} ~ {}\n",
        view.interval,
        from.format("%H:%M"),
        to.format("%H:%M")
    );
    for ds in view.chart.iter().filter(|d| d.metric == Metric::NetValue) {
        let tail = &ds.points[ds.points.len().saturating_sub(width)..];
        let last = ds.points.last().map_or_else(|| "-".to_string(), |p| format_value(p.y));
        out.push_str(&format!("{:<20} {} {}\n", ds.label, sparkline(tail), last));
    }
    out
}
