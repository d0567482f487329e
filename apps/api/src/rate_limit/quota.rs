//! Global upstream quota tracker.
//!
//! Approximates the provider-side request and token quota for an upstream model
//! family, independent of which caller is asking. This is a heuristic safety net:
//! the provider's real state is only known from its response headers after the fact.

use serde::Serialize;

use crate::rate_limit::window::{
    now_ms, SlidingWindowCounter, Window, WindowLimits, WindowUsage,
};

/// Usage at or above this share of a ceiling is reported as approaching.
pub const APPROACHING_THRESHOLD_PERCENT: f64 = 80.0;

/// The real upstream reset time is unknown, so a hit always asks for a minute.
pub const GLOBAL_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub requests: WindowLimits,
    pub tokens: WindowLimits,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            requests: WindowLimits {
                per_minute: 30,
                per_hour: 900,
                per_day: 14_400,
            },
            tokens: WindowLimits {
                per_minute: 60_000,
                per_hour: 1_000_000,
                per_day: 1_000_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub approaching_limit: bool,
    pub limit_hit: bool,
    /// Highest usage share across all windows and both dimensions.
    pub usage_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// The hit window when `limit_hit`, otherwise the busiest window.
    pub window: Window,
    pub current_count: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuotaUsage {
    pub window: Window,
    pub requests: u64,
    pub request_limit: u64,
    pub tokens: u64,
    pub token_limit: u64,
    pub usage_percent: f64,
}

pub struct GlobalQuotaTracker {
    counter: SlidingWindowCounter,
    limits: QuotaLimits,
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    used as f64 * 100.0 / limit as f64
}

impl GlobalQuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            counter: SlidingWindowCounter::new(),
            limits,
        }
    }

    pub fn check_global_limits(&self, model: &str, estimated_tokens: u64) -> QuotaStatus {
        self.check_global_limits_at(model, estimated_tokens, now_ms())
    }

    /// Evaluates the usage already recorded for `model`, then records this request
    /// unless a ceiling has been hit. Approaching a ceiling never blocks.
    pub fn check_global_limits_at(
        &self,
        model: &str,
        estimated_tokens: u64,
        now_ms: i64,
    ) -> QuotaStatus {
        self.counter
            .check_and_record(model, estimated_tokens, now_ms, |usage| {
                let status = self.evaluate(usage);
                (!status.limit_hit, status)
            })
    }

    /// `usage` is in `Window::ALL` order.
    fn evaluate(&self, usage: &[WindowUsage; 3]) -> QuotaStatus {
        let mut busiest: Option<(Window, f64, u64, u64)> = None;
        let mut hit: Option<(Window, u64, u64)> = None;

        for (window, usage) in Window::ALL.into_iter().zip(usage) {
            let request_limit = self.limits.requests.limit(window);
            let token_limit = self.limits.tokens.limit(window);

            let request_pct = percent(usage.requests, request_limit);
            let token_pct = percent(usage.tokens, token_limit);
            let (pct, count, limit) = if token_pct > request_pct {
                (token_pct, usage.tokens, token_limit)
            } else {
                (request_pct, usage.requests, request_limit)
            };

            if hit.is_none() && pct >= 100.0 {
                hit = Some((window, count, limit));
            }
            if busiest.map_or(true, |(_, best, _, _)| pct > best) {
                busiest = Some((window, pct, count, limit));
            }
        }

        let (busy_window, usage_percent, busy_count, busy_limit) =
            busiest.unwrap_or((Window::Minute, 0.0, 0, 0));

        if let Some((window, count, limit)) = hit {
            return QuotaStatus {
                approaching_limit: false,
                limit_hit: true,
                usage_percent,
                retry_after: Some(GLOBAL_RETRY_AFTER_SECS),
                window,
                current_count: count,
                limit,
            };
        }

        QuotaStatus {
            approaching_limit: usage_percent >= APPROACHING_THRESHOLD_PERCENT,
            limit_hit: false,
            usage_percent,
            retry_after: None,
            window: busy_window,
            current_count: busy_count,
            limit: busy_limit,
        }
    }

    /// Current usage per window, for the quota status endpoint.
    pub fn snapshot(&self, model: &str) -> Vec<WindowQuotaUsage> {
        self.snapshot_at(model, now_ms())
    }

    pub fn snapshot_at(&self, model: &str, now_ms: i64) -> Vec<WindowQuotaUsage> {
        Window::ALL
            .iter()
            .map(|&window| {
                let usage = self.counter.usage(model, window, now_ms);
                let request_limit = self.limits.requests.limit(window);
                let token_limit = self.limits.tokens.limit(window);
                WindowQuotaUsage {
                    window,
                    requests: usage.requests,
                    request_limit,
                    tokens: usage.tokens,
                    token_limit,
                    usage_percent: percent(usage.requests, request_limit)
                        .max(percent(usage.tokens, token_limit)),
                }
            })
            .collect()
    }
}
