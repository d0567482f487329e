//! Per-caller throttling keyed by `(identity, endpoint, model)`.

use std::collections::HashMap;

use serde::Serialize;

use crate::rate_limit::window::{now_ms, SlidingWindowCounter, Window, WindowLimits};

/// Model key used when the caller does not name one.
pub const DEFAULT_MODEL_KEY: &str = "default";

pub const DEFAULT_PER_MINUTE: u64 = 5;
pub const DEFAULT_PER_HOUR: u64 = 30;
pub const DEFAULT_PER_DAY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    PerIdentity,
    GlobalUpstream,
}

impl LimitType {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitType::PerIdentity => "per_identity",
            LimitType::GlobalUpstream => "global_upstream",
        }
    }
}

/// Outcome of one admission check. Computed fresh per request; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Seconds to wait. Present only when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub limit_type: LimitType,
    pub current_count: u64,
    pub limit: u64,
    /// The exceeded window when denied, otherwise the minute window.
    pub window: Window,
}

/// Ceilings per model, falling back to `defaults`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub defaults: WindowLimits,
    pub per_model: HashMap<String, WindowLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            defaults: WindowLimits {
                per_minute: DEFAULT_PER_MINUTE,
                per_hour: DEFAULT_PER_HOUR,
                per_day: DEFAULT_PER_DAY,
            },
            per_model: HashMap::new(),
        }
    }
}

pub struct RateLimiter {
    counter: SlidingWindowCounter,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            counter: SlidingWindowCounter::new(),
            config,
        }
    }

    pub fn limits_for(&self, model: Option<&str>) -> WindowLimits {
        model
            .and_then(|m| self.config.per_model.get(m))
            .copied()
            .unwrap_or(self.config.defaults)
    }

    /// Records the attempt and decides whether it fits every window.
    ///
    /// Denied attempts are recorded too, so hammering keeps the window full.
    pub fn check_rate_limit(
        &self,
        identity: &str,
        endpoint: &str,
        model: Option<&str>,
        estimated_tokens: Option<u64>,
    ) -> RateLimitResult {
        self.check_rate_limit_at(identity, endpoint, model, estimated_tokens, now_ms())
    }

    pub fn check_rate_limit_at(
        &self,
        identity: &str,
        endpoint: &str,
        model: Option<&str>,
        estimated_tokens: Option<u64>,
        now_ms: i64,
    ) -> RateLimitResult {
        let model_key = model.unwrap_or(DEFAULT_MODEL_KEY);
        let limits = self.limits_for(Some(model_key));
        let key = format!("{identity}:{endpoint}:{model_key}");

        let outcome = self.counter.record_and_count(
            &key,
            &limits.specs(),
            estimated_tokens.unwrap_or(0),
            now_ms,
        );

        match outcome.exceeded {
            Some(exceeded) => RateLimitResult {
                allowed: false,
                // A denial always asks the caller to wait at least a second.
                retry_after: Some(exceeded.retry_after_secs.max(1)),
                limit_type: LimitType::PerIdentity,
                current_count: exceeded.count,
                limit: exceeded.limit,
                window: exceeded.window,
            },
            None => {
                let minute = outcome.counts.first().copied();
                RateLimitResult {
                    allowed: true,
                    retry_after: None,
                    limit_type: LimitType::PerIdentity,
                    current_count: minute.map(|c| c.count).unwrap_or(0),
                    limit: minute.map(|c| c.limit).unwrap_or(limits.per_minute),
                    window: Window::Minute,
                }
            }
        }
    }
}
