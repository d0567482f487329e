use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::llm_client::models::CATALOG;
use crate::rate_limit::{QuotaLimits, RateLimitConfig, Window, WindowLimits};

const DEFAULT_TOOLS_BASE_URL: &str = "http://localhost:3000/api/tools";
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 60;

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing. Limit values never do:
/// a bad ceiling is logged and replaced by its default.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub anthropic_api_key: String,
    pub cerebras_api_key: Option<String>,
    pub tools_base_url: String,
    pub fingerprint_salt: String,
    pub pipeline_timeout: Duration,
    pub rate_limits: RateLimitConfig,
    pub quota_limits: QuotaLimits,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let env = |key: &str| std::env::var(key).ok();

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            cerebras_api_key: env("CEREBRAS_API_KEY").filter(|k| !k.trim().is_empty()),
            tools_base_url: env("TOOLS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_TOOLS_BASE_URL.to_string()),
            fingerprint_salt: env("FINGERPRINT_SALT").unwrap_or_default(),
            pipeline_timeout: Duration::from_secs(env("PIPELINE_TIMEOUT_SECS").map_or(
                DEFAULT_PIPELINE_TIMEOUT_SECS,
                |raw| parse_positive("PIPELINE_TIMEOUT_SECS", &raw, DEFAULT_PIPELINE_TIMEOUT_SECS),
            )),
            rate_limits: rate_limit_config(env),
            quota_limits: quota_limits(env),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

// ────────────────────────────────────────────────────────────────────────────
// Limit parsing
// ────────────────────────────────────────────────────────────────────────────

/// Parses a positive integer, warning and returning `fallback` otherwise.
fn parse_positive(key: &str, raw: &str, fallback: u64) -> u64 {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => value,
        _ => {
            warn!("Invalid value '{raw}' for {key}; using default {fallback}");
            fallback
        }
    }
}

fn window_suffix(window: Window) -> &'static str {
    match window {
        Window::Minute => "PER_MINUTE",
        Window::Hour => "PER_HOUR",
        Window::Day => "PER_DAY",
    }
}

/// Resolves `{prefix}_PER_{MINUTE,HOUR,DAY}` independently. Unset values
/// inherit from `inherited`; invalid ones fall back to `defaults`.
fn window_limits<F>(
    env: &F,
    prefix: &str,
    inherited: WindowLimits,
    defaults: WindowLimits,
) -> WindowLimits
where
    F: Fn(&str) -> Option<String>,
{
    let resolve = |window: Window| {
        let key = format!("{prefix}_{}", window_suffix(window));
        match env(&key) {
            Some(raw) => parse_positive(&key, &raw, defaults.limit(window)),
            None => inherited.limit(window),
        }
    };

    WindowLimits {
        per_minute: resolve(Window::Minute),
        per_hour: resolve(Window::Hour),
        per_day: resolve(Window::Day),
    }
}

/// `cerebras-llama` becomes `CEREBRAS_LLAMA`.
fn model_env_key(model: &str) -> String {
    model.to_ascii_uppercase().replace('-', "_")
}

pub fn rate_limit_config<F>(env: F) -> RateLimitConfig
where
    F: Fn(&str) -> Option<String>,
{
    let builtin = RateLimitConfig::default().defaults;
    let defaults = window_limits(&env, "RATE_LIMIT", builtin, builtin);

    let per_model = CATALOG
        .iter()
        .map(|spec| {
            let prefix = format!("RATE_LIMIT_{}", model_env_key(spec.key));
            (spec.key.to_string(), window_limits(&env, &prefix, defaults, builtin))
        })
        .filter(|(_, limits)| *limits != defaults)
        .collect::<HashMap<_, _>>();

    RateLimitConfig {
        defaults,
        per_model,
    }
}

pub fn quota_limits<F>(env: F) -> QuotaLimits
where
    F: Fn(&str) -> Option<String>,
{
    let builtin = QuotaLimits::default();
    QuotaLimits {
        requests: window_limits(
            &env,
            "GLOBAL_QUOTA_REQUESTS",
            builtin.requests,
            builtin.requests,
        ),
        tokens: window_limits(&env, "GLOBAL_QUOTA_TOKENS", builtin.tokens, builtin.tokens),
    }
}
