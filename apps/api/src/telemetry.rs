//! Rate-limit telemetry. Delivery is fire-and-forget: a failing sink is logged
//! at debug level and never reaches the request path.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::debug;

use crate::rate_limit::{LimitType, Window};

/// One denied admission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEvent {
    pub endpoint: String,
    pub model: String,
    pub limit_type: LimitType,
    pub window: Window,
    pub current_count: u64,
    pub limit: u64,
    /// Salted hash of the caller address. The raw address is never recorded.
    pub fingerprint: String,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, event: &RateLimitEvent) -> Result<()>;
}

pub struct PgTelemetrySink {
    pool: PgPool,
}

impl PgTelemetrySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetrySink for PgTelemetrySink {
    async fn record(&self, event: &RateLimitEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_events
                (endpoint, model, limit_type, time_window, current_count, limit_value,
                 fingerprint, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&event.endpoint)
        .bind(&event.model)
        .bind(event.limit_type.as_str())
        .bind(event.window.as_str())
        .bind(event.current_count as i64)
        .bind(event.limit as i64)
        .bind(&event.fingerprint)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Spawns delivery of `event` and returns immediately.
///
/// Outside a tokio runtime the event is dropped.
pub fn dispatch(sink: Arc<dyn TelemetrySink>, event: RateLimitEvent) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("No runtime available; dropping rate limit telemetry event");
        return;
    };
    handle.spawn(async move {
        if let Err(e) = sink.record(&event).await {
            debug!("Rate limit telemetry delivery failed: {e:#}");
        }
    });
}
