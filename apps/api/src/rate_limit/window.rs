//! Sliding-window counter shared by the per-caller limiter and the global quota tracker.
//!
//! Each key owns an append-only log of request timestamps (ms since epoch) with a
//! parallel log of token weights. Counts for a window are computed from the log on
//! demand, so one entry serves the minute, hour and day ceilings at once.
//!
//! State is process-local. A restart forgets every counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Entries older than this are dropped during cleanup.
const MAX_WINDOW_MS: i64 = DAY_MS;
/// Cleanup runs lazily, at most once per interval.
const CLEANUP_INTERVAL_MS: i64 = 5 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    /// Smallest to largest. Evaluation order matters: the first exceeded window wins.
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    pub fn duration_ms(self) -> i64 {
        match self {
            Window::Minute => MINUTE_MS,
            Window::Hour => HOUR_MS,
            Window::Day => DAY_MS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

/// Per-window ceilings. Used both for request counts and token totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
}

impl WindowLimits {
    pub fn limit(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }

    pub fn specs(&self) -> [WindowSpec; 3] {
        Window::ALL.map(|window| WindowSpec {
            window,
            limit: self.limit(window),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window: Window,
    pub limit: u64,
}

/// Usage of one key inside one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: u64,
    pub tokens: u64,
    pub oldest_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub window: Window,
    pub count: u64,
    pub limit: u64,
}

/// The first window (smallest duration) whose post-append count exceeded its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exceeded {
    pub window: Window,
    pub count: u64,
    pub limit: u64,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountOutcome {
    /// Counts in ascending window order.
    pub counts: Vec<WindowCount>,
    pub exceeded: Option<Exceeded>,
}

#[derive(Debug, Default)]
struct CounterEntry {
    timestamps: VecDeque<i64>,
    tokens: VecDeque<u64>,
}

impl CounterEntry {
    fn push(&mut self, now_ms: i64, tokens: u64) {
        // Keep the log sorted even if two callers observed the clock out of order.
        let ts = match self.timestamps.back() {
            Some(&last) if last > now_ms => last,
            _ => now_ms,
        };
        self.timestamps.push_back(ts);
        self.tokens.push_back(tokens);
    }

    fn prune(&mut self, cutoff_ms: i64) {
        while matches!(self.timestamps.front(), Some(&ts) if ts < cutoff_ms) {
            self.timestamps.pop_front();
            self.tokens.pop_front();
        }
    }

    fn usage(&self, now_ms: i64, duration_ms: i64) -> WindowUsage {
        let cutoff = now_ms - duration_ms;
        let start = self.timestamps.partition_point(|&ts| ts < cutoff);
        WindowUsage {
            requests: (self.timestamps.len() - start) as u64,
            tokens: self.tokens.range(start..).sum(),
            oldest_ms: self.timestamps.get(start).copied(),
        }
    }

    fn is_empty(&self) -> bool {
        self.timestamps.is_empty() && self.tokens.is_empty()
    }
}

/// Seconds until the oldest in-window timestamp leaves the window, rounded up.
pub fn retry_after_secs(oldest_ms: i64, duration_ms: i64, now_ms: i64) -> u64 {
    let remaining = oldest_ms + duration_ms - now_ms;
    if remaining <= 0 {
        0
    } else {
        ((remaining + 999) / 1000) as u64
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Multi-window request/token counter keyed by an arbitrary string.
pub struct SlidingWindowCounter {
    entries: DashMap<String, CounterEntry>,
    last_cleanup_ms: AtomicI64,
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowCounter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            last_cleanup_ms: AtomicI64::new(0),
        }
    }

    /// Appends one request for `key`, then counts every window smallest-first.
    ///
    /// The request is recorded whether or not a window ends up exceeded.
    pub fn record_and_count(
        &self,
        key: &str,
        windows: &[WindowSpec],
        tokens: u64,
        now_ms: i64,
    ) -> CountOutcome {
        self.maybe_cleanup(now_ms);

        let mut specs = windows.to_vec();
        specs.sort_by_key(|spec| spec.window.duration_ms());

        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.push(now_ms, tokens);
        entry.prune(now_ms - MAX_WINDOW_MS);

        let mut counts = Vec::with_capacity(specs.len());
        let mut exceeded = None;

        for spec in specs {
            let duration = spec.window.duration_ms();
            let usage = entry.usage(now_ms, duration);
            counts.push(WindowCount {
                window: spec.window,
                count: usage.requests,
                limit: spec.limit,
            });

            if exceeded.is_none() && usage.requests > spec.limit {
                let oldest = usage.oldest_ms.unwrap_or(now_ms);
                exceeded = Some(Exceeded {
                    window: spec.window,
                    count: usage.requests,
                    limit: spec.limit,
                    retry_after_secs: retry_after_secs(oldest, duration, now_ms),
                });
            }
        }

        CountOutcome { counts, exceeded }
    }

    /// Evaluates every window for `key` and appends one request only when
    /// `decide` asks for it. The key stays locked from the read to the append,
    /// so concurrent callers cannot both claim the last free slot.
    pub fn check_and_record<R>(
        &self,
        key: &str,
        tokens: u64,
        now_ms: i64,
        decide: impl FnOnce(&[WindowUsage; 3]) -> (bool, R),
    ) -> R {
        self.maybe_cleanup(now_ms);

        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.prune(now_ms - MAX_WINDOW_MS);
        let usage = Window::ALL.map(|window| entry.usage(now_ms, window.duration_ms()));

        let (record, outcome) = decide(&usage);
        if record {
            entry.push(now_ms, tokens);
        }
        outcome
    }

    /// Appends one request without evaluating any window.
    #[cfg(test)]
    pub fn record(&self, key: &str, tokens: u64, now_ms: i64) {
        self.maybe_cleanup(now_ms);
        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.push(now_ms, tokens);
        entry.prune(now_ms - MAX_WINDOW_MS);
    }

    /// Read-only view of `key` inside `window`. Unknown keys report zero usage.
    pub fn usage(&self, key: &str, window: Window, now_ms: i64) -> WindowUsage {
        self.entries
            .get(key)
            .map(|entry| entry.usage(now_ms, window.duration_ms()))
            .unwrap_or_default()
    }

    /// Drops entries older than the largest window and removes keys left empty.
    /// Returns the number of keys removed.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - MAX_WINDOW_MS;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.prune(cutoff);
            !entry.is_empty()
        });
        self.last_cleanup_ms.store(now_ms, Ordering::Relaxed);
        before.saturating_sub(self.entries.len())
    }

    fn maybe_cleanup(&self, now_ms: i64) {
        let last = self.last_cleanup_ms.load(Ordering::Relaxed);
        if now_ms - last < CLEANUP_INTERVAL_MS {
            return;
        }
        // Only one caller wins the slot for this interval.
        if self
            .last_cleanup_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.cleanup(now_ms);
            if removed > 0 {
                tracing::debug!("Rate counter cleanup removed {removed} idle keys");
            }
        }
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}
