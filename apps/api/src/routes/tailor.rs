//! Axum route handler for the streaming tailoring endpoint.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::errors::AppError;
use crate::llm_client::models;
use crate::pipeline::{PipelineEvent, RunEmitter, TailoringRequest};
use crate::rate_limit::identity::client_address;
use crate::rate_limit::limiter::DEFAULT_MODEL_KEY;
use crate::state::AppState;

pub const TAILOR_ENDPOINT: &str = "tailor";

pub const MIN_INPUT_CHARS: usize = 100;
pub const MAX_INPUT_CHARS: usize = 50_000;

/// Output allowance added to the prompt estimate.
const OUTPUT_TOKEN_ALLOWANCE: u64 = 4096;

/// Events buffered between the pipeline task and the response body.
const EVENT_BUFFER: usize = 32;

// ────────────────────────────────────────────────────────────────────────────
// Request types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailorRequest {
    pub resume: String,
    pub job_description: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn validate_text(field: &str, value: &str) -> Result<(), AppError> {
    let chars = value.trim().chars().count();
    if chars < MIN_INPUT_CHARS {
        return Err(AppError::Validation(format!(
            "{field} must be at least {MIN_INPUT_CHARS} characters"
        )));
    }
    if chars > MAX_INPUT_CHARS {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_INPUT_CHARS} characters"
        )));
    }
    Ok(())
}

/// Rough prompt size at four characters per token, plus the output allowance.
pub fn estimate_tokens(resume: &str, job_description: &str) -> u64 {
    let chars = (resume.chars().count() + job_description.chars().count()) as u64;
    chars.div_ceil(4) + OUTPUT_TOKEN_ALLOWANCE
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/tailor
///
/// Validates the input, runs admission, then streams the pipeline's progress
/// as server-sent events. A denied request never opens a stream.
pub async fn handle_tailor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TailorRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    validate_text("resume", &request.resume)?;
    validate_text("jobDescription", &request.job_description)?;

    let model_key = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_MODEL_KEY)
        .to_string();
    if models::lookup(&model_key).is_none() {
        return Err(AppError::Validation(format!("Unknown model '{model_key}'")));
    }

    let address = client_address(&headers);
    let estimated_tokens = estimate_tokens(&request.resume, &request.job_description);
    let decision = state
        .gate
        .check(&address, TAILOR_ENDPOINT, &model_key, estimated_tokens);

    if !decision.allowed {
        return Err(AppError::RateLimited {
            retry_after: decision.result.retry_after.unwrap_or(1),
            limit_type: decision.result.limit_type,
            window: decision.result.window,
        });
    }

    info!(
        model = %model_key,
        fingerprint = %decision.fingerprint,
        estimated_tokens,
        quota_percent = ?decision.quota.as_ref().map(|q| q.usage_percent),
        "Starting tailoring run"
    );

    let (tx, rx) = mpsc::channel::<PipelineEvent>(EVENT_BUFFER);
    let run_request = TailoringRequest {
        resume: request.resume,
        job_description: request.job_description,
        model_key,
        fingerprint: decision.fingerprint,
    };
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let mut emitter = RunEmitter::new(tx);
        pipeline.run(run_request, &mut emitter).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_sse()));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
