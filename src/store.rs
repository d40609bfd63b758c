// ===============================
// src/store.rs (Series Store + Subscription Set)
// ===============================
//
// Owns everything the engine mutates:
// - Subscription Set (ordered, insertion order = color order in the chart)
// - display names
// - one Canonical Series per subscribed code
// - Filter Selection (view-only, never touches the series)
// - dirty flag for the persistence timer
//
// Invariant: a series exists for a code iff the code is subscribed.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, FixedOffset, Timelike};

use crate::domain::{MinuteBucket, Snapshot, TickEvent};
use crate::error::FlowError;

pub const DEFAULT_SERIES_CAP: usize = 1000;

pub fn minute_floor(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

#[derive(Debug, Clone)]
pub struct SeriesStore {
    cap: usize,
    codes: Vec<String>,
    names: HashMap<String, String>,
    series: HashMap<String, Vec<MinuteBucket>>,
    filter: Vec<String>,
    dirty: bool,
}

impl SeriesStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            codes: Vec::new(),
            names: HashMap::new(),
            series: HashMap::new(),
            filter: Vec::new(),
            dirty: false,
        }
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn is_subscribed(&self, code: &str) -> bool {
        self.series.contains_key(code)
    }

    /// Display name, falling back to the code itself.
    pub fn name<'a>(&'a self, code: &'a str) -> &'a str {
        self.names
            .get(code)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .unwrap_or(code)
    }

    pub fn add_code(&mut self, code: &str, name: &str) -> Result<(), FlowError> {
        if self.is_subscribed(code) {
            return Err(FlowError::AlreadySubscribed(code.to_string()));
        }
        self.codes.push(code.to_string());
        self.names.insert(code.to_string(), name.to_string());
        self.series.insert(code.to_string(), Vec::new());
        self.dirty = true;
        Ok(())
    }

    /// Drops the code, its series, its name and its filter entry.
    /// Returns false if the code was not subscribed.
    pub fn remove_code(&mut self, code: &str) -> bool {
        if self.series.remove(code).is_none() {
            return false;
        }
        self.codes.retain(|c| c != code);
        self.names.remove(code);
        self.filter.retain(|c| c != code);
        self.dirty = true;
        true
    }

    pub fn clear(&mut self) {
        self.codes.clear();
        self.names.clear();
        self.series.clear();
        self.filter.clear();
        self.dirty = true;
    }

    /// Upsert one tick into its minute bucket.
    ///
    /// Upstream values are cumulative for the day, so a second tick in the same
    /// minute replaces the bucket instead of adding to it. Returns false (and
    /// changes nothing) when the code is not subscribed.
    pub fn ingest(&mut self, ev: &TickEvent) -> bool {
        let Some(series) = self.series.get_mut(&ev.code) else {
            return false;
        };
        let minute = minute_floor(ev.ts);
        match series.binary_search_by(|b| b.minute_start.cmp(&minute)) {
            Ok(i) => series[i].overwrite(ev),
            Err(i) => {
                series.insert(i, MinuteBucket::from_tick(ev, minute));
                if series.len() > self.cap {
                    let excess = series.len() - self.cap;
                    series.drain(..excess);
                }
            }
        }
        self.dirty = true;
        true
    }

    pub fn series(&self, code: &str) -> Option<&[MinuteBucket]> {
        self.series.get(code).map(Vec::as_slice)
    }

    pub fn filter(&self) -> &[String] {
        &self.filter
    }

    /// Empty selection means "show all". Unknown codes are rejected.
    pub fn set_filter(&mut self, codes: Vec<String>) -> Result<(), FlowError> {
        if let Some(bad) = codes.iter().find(|c| !self.is_subscribed(c)) {
            return Err(FlowError::NotSubscribed(bad.clone()));
        }
        let mut picked: Vec<String> = Vec::with_capacity(codes.len());
        for c in codes {
            if !picked.contains(&c) {
                picked.push(c);
            }
        }
        self.filter = picked;
        Ok(())
    }

    pub fn is_visible(&self, code: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|c| c == code)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Read-and-clear, used by the flush timer.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn snapshot(&self, saved_at: DateTime<FixedOffset>) -> Snapshot {
        Snapshot {
            chart_data: self
                .codes
                .iter()
                .map(|c| (c.clone(), self.series.get(c).cloned().unwrap_or_default()))
                .collect(),
            subscribed_codes: self.codes.clone(),
            code_name_map: self
                .codes
                .iter()
                .map(|c| (c.clone(), self.names.get(c).cloned().unwrap_or_default()))
                .collect(),
            saved_at: Some(saved_at.to_rfc3339()),
        }
    }

    /// Replace all state with a snapshot. Each series is re-sorted, duplicate
    /// minutes collapse to the later entry and the cap keeps the newest buckets.
    /// The filter is reset and the dirty flag is left untouched.
    pub fn load_snapshot(&mut self, snap: Snapshot) {
        let Snapshot {
            mut chart_data,
            subscribed_codes,
            code_name_map,
            ..
        } = snap;

        self.codes.clear();
        self.names.clear();
        self.series.clear();
        self.filter.clear();

        for code in subscribed_codes {
            if self.series.contains_key(&code) {
                continue;
            }
            let mut buckets = chart_data.remove(&code).unwrap_or_default();
            for b in buckets.iter_mut() {
                b.minute_start = minute_floor(b.minute_start);
            }
            buckets.sort_by(|a, b| a.minute_start.cmp(&b.minute_start));
            let mut deduped: Vec<MinuteBucket> = Vec::with_capacity(buckets.len());
            for b in buckets {
                match deduped.last_mut() {
                    Some(last) if last.minute_start == b.minute_start => *last = b,
                    _ => deduped.push(b),
                }
            }
            if deduped.len() > self.cap {
                let excess = deduped.len() - self.cap;
                deduped.drain(..excess);
            }
            let name = code_name_map.get(&code).cloned().unwrap_or_default();
            self.names.insert(code.clone(), name);
            self.series.insert(code.clone(), deduped);
            self.codes.push(code);
        }
    }
}
