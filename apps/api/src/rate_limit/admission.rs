//! Request admission: per-caller limiter first, then the global upstream quota.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::llm_client::models;
use crate::rate_limit::limiter::{LimitType, RateLimitResult, RateLimiter};
use crate::rate_limit::quota::{GlobalQuotaTracker, QuotaStatus};
use crate::telemetry::{self, RateLimitEvent, TelemetrySink};

/// Hex characters kept from the address digest.
const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// The deciding result: the limiter's, or a global-upstream denial.
    pub result: RateLimitResult,
    /// Present when the model belongs to the tracked upstream family and
    /// the limiter let the request through.
    pub quota: Option<QuotaStatus>,
    pub fingerprint: String,
}

pub struct AdmissionGate {
    limiter: RateLimiter,
    quota: GlobalQuotaTracker,
    telemetry: Arc<dyn TelemetrySink>,
    salt: String,
}

/// Salted, truncated SHA-256 of the caller address. Safe to log.
pub fn fingerprint(address: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(address.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

impl AdmissionGate {
    pub fn new(
        limiter: RateLimiter,
        quota: GlobalQuotaTracker,
        telemetry: Arc<dyn TelemetrySink>,
        salt: String,
    ) -> Self {
        Self {
            limiter,
            quota,
            telemetry,
            salt,
        }
    }

    pub fn quota(&self) -> &GlobalQuotaTracker {
        &self.quota
    }

    /// Per-caller limiter first; the global tracker only for tracked models
    /// the limiter let through.
    pub fn check(
        &self,
        address: &str,
        endpoint: &str,
        model_key: &str,
        estimated_tokens: u64,
    ) -> AdmissionDecision {
        let result = self.limiter.check_rate_limit(
            address,
            endpoint,
            Some(model_key),
            Some(estimated_tokens),
        );
        self.decide(address, endpoint, model_key, result, || {
            self.quota.check_global_limits(model_key, estimated_tokens)
        })
    }

    /// `check` at a fixed clock.
    #[cfg(test)]
    pub fn check_at(
        &self,
        address: &str,
        endpoint: &str,
        model_key: &str,
        estimated_tokens: u64,
        now_ms: i64,
    ) -> AdmissionDecision {
        let result = self.limiter.check_rate_limit_at(
            address,
            endpoint,
            Some(model_key),
            Some(estimated_tokens),
            now_ms,
        );
        self.decide(address, endpoint, model_key, result, || {
            self.quota
                .check_global_limits_at(model_key, estimated_tokens, now_ms)
        })
    }

    fn decide(
        &self,
        address: &str,
        endpoint: &str,
        model_key: &str,
        result: RateLimitResult,
        check_global: impl FnOnce() -> QuotaStatus,
    ) -> AdmissionDecision {
        let fingerprint = fingerprint(address, &self.salt);

        if !result.allowed {
            self.deny(endpoint, model_key, &result, &fingerprint);
            return AdmissionDecision {
                allowed: false,
                result,
                quota: None,
                fingerprint,
            };
        }

        let tracked = models::lookup(model_key).is_some_and(|m| m.quota_tracked());
        if !tracked {
            return AdmissionDecision {
                allowed: true,
                result,
                quota: None,
                fingerprint,
            };
        }

        let status = check_global();

        if status.limit_hit {
            let denied = RateLimitResult {
                allowed: false,
                retry_after: status.retry_after,
                limit_type: LimitType::GlobalUpstream,
                current_count: status.current_count,
                limit: status.limit,
                window: status.window,
            };
            self.deny(endpoint, model_key, &denied, &fingerprint);
            return AdmissionDecision {
                allowed: false,
                result: denied,
                quota: Some(status),
                fingerprint,
            };
        }

        if status.approaching_limit {
            warn!(
                model = model_key,
                window = status.window.as_str(),
                usage_percent = status.usage_percent,
                "Global upstream quota approaching limit"
            );
        }

        AdmissionDecision {
            allowed: true,
            result,
            quota: Some(status),
            fingerprint,
        }
    }

    fn deny(&self, endpoint: &str, model_key: &str, result: &RateLimitResult, fingerprint: &str) {
        info!(
            endpoint,
            model = model_key,
            limit_type = result.limit_type.as_str(),
            window = result.window.as_str(),
            current_count = result.current_count,
            limit = result.limit,
            fingerprint,
            "Request denied by rate limit"
        );

        telemetry::dispatch(
            self.telemetry.clone(),
            RateLimitEvent {
                endpoint: endpoint.to_string(),
                model: model_key.to_string(),
                limit_type: result.limit_type,
                window: result.window,
                current_count: result.current_count,
                limit: result.limit,
                fingerprint: fingerprint.to_string(),
                occurred_at: chrono::Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::limiter::RateLimitConfig;
    use crate::rate_limit::quota::{QuotaLimits, GLOBAL_RETRY_AFTER_SECS};
    use crate::rate_limit::window::{Window, WindowLimits};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<RateLimitEvent>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn record(&self, event: &RateLimitEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl TelemetrySink for FailingSink {
        async fn record(&self, _event: &RateLimitEvent) -> anyhow::Result<()> {
            Err(anyhow!("telemetry backend down"))
        }
    }

    fn gate(per_minute: u64, quota_per_minute: u64, sink: Arc<dyn TelemetrySink>) -> AdmissionGate {
        let mut limits = RateLimitConfig::default();
        limits.defaults.per_minute = per_minute;
        let quota = QuotaLimits {
            requests: WindowLimits {
                per_minute: quota_per_minute,
                per_hour: 10_000,
                per_day: 100_000,
            },
            ..QuotaLimits::default()
        };
        AdmissionGate::new(
            RateLimiter::new(limits),
            GlobalQuotaTracker::new(quota),
            sink,
            "test-salt".to_string(),
        )
    }

    #[test]
    fn test_fingerprint_is_stable_salted_and_truncated() {
        let a = fingerprint("203.0.113.7", "salt");
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_eq!(a, fingerprint("203.0.113.7", "salt"));
        assert_ne!(a, fingerprint("203.0.113.7", "other-salt"));
        assert_ne!(a, fingerprint("203.0.113.8", "salt"));
        assert!(!a.contains("203"));
    }

    #[test]
    fn test_untracked_model_skips_global_quota() {
        let gate = gate(100, 1, Arc::new(RecordingSink::default()));
        for _ in 0..3 {
            let decision = gate.check_at("ip", "tailor", "claude-sonnet", 1_000, 0);
            assert!(decision.allowed);
            assert!(decision.quota.is_none());
        }
    }

    #[test]
    fn test_tracked_model_denied_by_global_quota_across_callers() {
        let gate = gate(100, 2, Arc::new(RecordingSink::default()));
        assert!(gate.check_at("a", "tailor", "cerebras-llama", 10, 0).allowed);
        assert!(gate.check_at("b", "tailor", "cerebras-llama", 10, 0).allowed);

        let decision = gate.check_at("c", "tailor", "cerebras-llama", 10, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.result.limit_type, LimitType::GlobalUpstream);
        assert_eq!(decision.result.retry_after, Some(GLOBAL_RETRY_AFTER_SECS));
        assert_eq!(decision.result.window, Window::Minute);
        assert!(decision.quota.is_some_and(|q| q.limit_hit));
    }

    #[test]
    fn test_identity_denial_short_circuits_global_check() {
        let gate = gate(1, 100, Arc::new(RecordingSink::default()));
        gate.check_at("a", "tailor", "cerebras-llama", 10, 0);
        let decision = gate.check_at("a", "tailor", "cerebras-llama", 10, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.result.limit_type, LimitType::PerIdentity);
        assert!(decision.quota.is_none());
        // Only the admitted request reached the global tracker.
        assert_eq!(gate.quota().snapshot_at("cerebras-llama", 0)[0].requests, 1);
    }

    #[tokio::test]
    async fn test_denial_emits_telemetry_without_raw_address() {
        let sink = Arc::new(RecordingSink::default());
        let gate = gate(1, 100, sink.clone());
        gate.check_at("198.51.100.4", "tailor", "default", 10, 0);
        let decision = gate.check_at("198.51.100.4", "tailor", "default", 10, 0);
        assert!(!decision.allowed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fingerprint, decision.fingerprint);
        assert_eq!(events[0].endpoint, "tailor");
        assert_eq!(events[0].current_count, 2);
        let json = serde_json::to_string(&events[0]).unwrap();
        assert!(!json.contains("198.51.100.4"));
    }

    #[tokio::test]
    async fn test_failing_telemetry_does_not_affect_decision() {
        let gate = gate(1, 100, Arc::new(FailingSink));
        assert!(gate.check_at("ip", "tailor", "default", 10, 0).allowed);
        let decision = gate.check_at("ip", "tailor", "default", 10, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.result.retry_after, Some(60));
    }
}
