//! Read-only view of the global upstream quota.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::llm_client::models;
use crate::rate_limit::quota::{WindowQuotaUsage, APPROACHING_THRESHOLD_PERCENT};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResponse {
    pub model: String,
    pub approaching_limit: bool,
    pub windows: Vec<WindowQuotaUsage>,
}

/// GET /api/v1/quota/:model
///
/// Current usage per window for a model in the tracked upstream family.
/// Reading the quota never records usage.
pub async fn handle_quota(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<QuotaResponse>, AppError> {
    let tracked = models::lookup(&model).is_some_and(|m| m.quota_tracked());
    if !tracked {
        return Err(AppError::NotFound(format!(
            "Model '{model}' has no global quota"
        )));
    }

    let windows = state.gate.quota().snapshot(&model);
    let approaching_limit = windows
        .iter()
        .any(|w| w.usage_percent >= APPROACHING_THRESHOLD_PERCENT);

    Ok(Json(QuotaResponse {
        model,
        approaching_limit,
        windows,
    }))
}
