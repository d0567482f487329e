//! Model catalog: the keys callers may request and where each one runs.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    /// OpenAI-compatible chat completions API with a shared account-wide quota.
    Cerebras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub key: &'static str,
    pub provider: Provider,
    pub upstream_id: &'static str,
    pub max_output_tokens: u32,
}

impl ModelSpec {
    /// Whether requests for this model count against the global upstream quota.
    pub fn quota_tracked(&self) -> bool {
        self.provider == Provider::Cerebras
    }
}

pub const CATALOG: &[ModelSpec] = &[
    ModelSpec {
        key: "default",
        provider: Provider::Anthropic,
        upstream_id: "claude-sonnet-4-5",
        max_output_tokens: 4096,
    },
    ModelSpec {
        key: "claude-sonnet",
        provider: Provider::Anthropic,
        upstream_id: "claude-sonnet-4-5",
        max_output_tokens: 4096,
    },
    ModelSpec {
        key: "claude-haiku",
        provider: Provider::Anthropic,
        upstream_id: "claude-haiku-4-5",
        max_output_tokens: 4096,
    },
    ModelSpec {
        key: "cerebras-llama",
        provider: Provider::Cerebras,
        upstream_id: "llama-3.3-70b",
        max_output_tokens: 4096,
    },
    ModelSpec {
        key: "cerebras-qwen",
        provider: Provider::Cerebras,
        upstream_id: "qwen-3-32b",
        max_output_tokens: 4096,
    },
];

pub fn lookup(key: &str) -> Option<&'static ModelSpec> {
    CATALOG.iter().find(|m| m.key == key)
}
