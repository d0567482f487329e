//! reqwest client for the enrichment tool endpoints.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::tools::{
    CompanyResearch, EnrichmentTools, FormatSpec, MetricsContext, ParsedResume, RelevancyScore,
    ToolError, ValidationReport,
};

const TOOL_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Deserialize)]
struct KeywordsResponse {
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResearchResponse {
    research: Option<CompanyResearch>,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    context: Option<MetricsContext>,
}

#[derive(Clone)]
pub struct HttpToolClient {
    client: Client,
    base_url: String,
}

impl HttpToolClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(TOOL_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, tool: &str) -> String {
        format!("{}/{}", self.base_url, tool)
    }

    async fn post<B, T>(&self, tool: &'static str, body: &B) -> Result<T, ToolError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!("Calling enrichment tool {tool}");
        let response = self
            .client
            .post(self.url(tool))
            .json(body)
            .send()
            .await
            .map_err(|source| ToolError::Http { tool, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status {
                tool,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ToolError::Http { tool, source })?;
        serde_json::from_slice(&bytes).map_err(|e| ToolError::Decode {
            tool,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl EnrichmentTools for HttpToolClient {
    async fn extract_keywords(&self, job_description: &str) -> Result<Vec<String>, ToolError> {
        let response: KeywordsResponse = self
            .post("extract-keywords", &json!({ "jobDescription": job_description }))
            .await?;
        Ok(response.keywords)
    }

    async fn parse_resume(&self, resume: &str) -> Result<ParsedResume, ToolError> {
        self.post("parse-resume", &json!({ "resume": resume })).await
    }

    async fn research_company(
        &self,
        job_description: &str,
    ) -> Result<Option<CompanyResearch>, ToolError> {
        let response: ResearchResponse = self
            .post("company-research", &json!({ "jobDescription": job_description }))
            .await?;
        Ok(response.research)
    }

    async fn metrics_context(&self, resume: &str) -> Result<Option<MetricsContext>, ToolError> {
        let response: MetricsResponse = self
            .post("metrics-context", &json!({ "resume": resume }))
            .await?;
        Ok(response.context)
    }

    async fn score_relevancy(
        &self,
        resume: &str,
        job_description: &str,
        keywords: &[String],
    ) -> Result<RelevancyScore, ToolError> {
        self.post(
            "relevancy-score",
            &json!({
                "resume": resume,
                "jobDescription": job_description,
                "keywords": keywords,
            }),
        )
        .await
    }

    async fn validate(
        &self,
        original: &str,
        tailored: &str,
    ) -> Result<ValidationReport, ToolError> {
        self.post(
            "validate",
            &json!({ "originalResume": original, "tailoredResume": tailored }),
        )
        .await
    }

    async fn recommend_format(
        &self,
        tailored: &str,
        job_description: &str,
    ) -> Result<FormatSpec, ToolError> {
        self.post(
            "format-recommendation",
            &json!({ "tailoredResume": tailored, "jobDescription": job_description }),
        )
        .await
    }
}
