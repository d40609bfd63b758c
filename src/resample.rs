// ===============================
// src/resample.rs
// ===============================
//
// Pure view over a Canonical Series. Chart and table both call `resample`
// with the same arguments so they can never disagree.
//
// Rules (U = interval minutes):
// - U == 1            -> series unchanged
// - finished windows  -> last bucket of the window, relabeled to the window start
// - in-progress window (the one holding the newest bucket):
//     * first bucket of the window, relabeled to the window start
//     * newest bucket at its own minute (skipped if it already sits on the start)
// Windows align to minute-of-day in the bucket's own offset: floor(mod / U) * U.
//
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Timelike};

use crate::domain::MinuteBucket;
use crate::error::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    M1,
    M3,
    M5,
    M10,
    M30,
    M60,
}

impl Interval {
    pub const ALL: [Interval; 6] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M10,
        Interval::M30,
        Interval::M60,
    ];

    pub fn minutes(self) -> u32 {
        match self {
            Interval::M1 => 1,
            Interval::M3 => 3,
            Interval::M5 => 5,
            Interval::M10 => 10,
            Interval::M30 => 30,
            Interval::M60 => 60,
        }
    }
}

impl TryFrom<u32> for Interval {
    type Error = FlowError;

    fn try_from(m: u32) -> Result<Self, Self::Error> {
        Interval::ALL
            .into_iter()
            .find(|i| i.minutes() == m)
            .ok_or(FlowError::InvalidInterval(m))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

/// Start of the `u`-minute window holding `minute_start` (already minute-aligned).
pub fn window_start(minute_start: DateTime<FixedOffset>, u: u32) -> DateTime<FixedOffset> {
    let minute_of_day = minute_start.hour() * 60 + minute_start.minute();
    let into_window = minute_of_day % u.max(1);
    minute_start - Duration::minutes(i64::from(into_window))
}

pub fn resample(series: &[MinuteBucket], interval: Interval) -> Vec<MinuteBucket> {
    let u = interval.minutes();
    if u == 1 {
        return series.to_vec();
    }
    let Some(newest) = series.last() else {
        return Vec::new();
    };
    let live_start = window_start(newest.minute_start, u);

    let mut out: Vec<MinuteBucket> = Vec::new();
    let mut current: Option<(DateTime<FixedOffset>, &MinuteBucket)> = None;

    let split = series
        .iter()
        .position(|b| b.minute_start >= live_start)
        .unwrap_or(series.len());

    for b in &series[..split] {
        let ws = window_start(b.minute_start, u);
        match current {
            Some((cur_ws, prev)) if cur_ws != ws => {
                out.push(prev.at(cur_ws));
                current = Some((ws, b));
            }
            _ => current = Some((ws, b)),
        }
    }
    if let Some((ws, last)) = current {
        out.push(last.at(ws));
    }

    if let Some(first_live) = series.get(split) {
        out.push(first_live.at(live_start));
        if newest.minute_start > live_start {
            out.push(newest.clone());
        }
    }
    out
}
