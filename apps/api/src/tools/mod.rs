//! Enrichment collaborators.
//!
//! Each tool is an HTTP endpoint with a JSON contract. The pipeline depends on the
//! `EnrichmentTools` trait and substitutes the documented default whenever a call
//! fails; none of these calls can fail a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("HTTP error calling {tool}: {source}")]
    Http {
        tool: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{tool} returned status {status}")]
    Status { tool: &'static str, status: u16 },

    #[error("{tool} returned an unexpected body: {message}")]
    Decode { tool: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeSection {
    pub title: String,
    pub content: String,
}

/// Structured view of the original resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResume {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sections: Vec<ResumeSection>,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyResearch {
    #[serde(default)]
    pub company: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Hints for quantifying achievements already present in the resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsContext {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevancyScore {
    /// 0 – 100
    pub score: u32,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    #[serde(default)]
    pub missing_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub claim: String,
    pub reason: String,
}

/// Fabrication check of the tailored resume against the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    /// False when the report is the fallback rather than a real check.
    #[serde(default = "default_verified")]
    pub verified: bool,
}

fn default_verified() -> bool {
    true
}

impl ValidationReport {
    pub fn unverified() -> Self {
        Self {
            passed: true,
            issues: vec![],
            verified: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSpec {
    pub layout: String,
    pub font: String,
    pub font_size_pt: f32,
    pub section_order: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            layout: "single-column".to_string(),
            font: "Inter".to_string(),
            font_size_pt: 11.0,
            section_order: ["Summary", "Experience", "Skills", "Education"]
                .map(String::from)
                .to_vec(),
            notes: vec![],
        }
    }
}

#[async_trait]
pub trait EnrichmentTools: Send + Sync {
    async fn extract_keywords(&self, job_description: &str) -> Result<Vec<String>, ToolError>;

    async fn parse_resume(&self, resume: &str) -> Result<ParsedResume, ToolError>;

    async fn research_company(
        &self,
        job_description: &str,
    ) -> Result<Option<CompanyResearch>, ToolError>;

    async fn metrics_context(&self, resume: &str) -> Result<Option<MetricsContext>, ToolError>;

    async fn score_relevancy(
        &self,
        resume: &str,
        job_description: &str,
        keywords: &[String],
    ) -> Result<RelevancyScore, ToolError>;

    async fn validate(&self, original: &str, tailored: &str)
        -> Result<ValidationReport, ToolError>;

    async fn recommend_format(
        &self,
        tailored: &str,
        job_description: &str,
    ) -> Result<FormatSpec, ToolError>;
}
