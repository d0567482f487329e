//! Tailoring pipeline: runs one request through every phase and reports
//! progress through a `RunEmitter`.
//!
//! Phases run strictly in order. Inside a fan-out phase the calls run
//! concurrently and each one falls back to its own default on failure.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::llm_client::parse::{parse_generation, GeneratedResume};
use crate::llm_client::prompts::HONESTY_INSTRUCTION;
use crate::llm_client::{GenerationOptions, LlmError, TextGenerator, Usage};
use crate::models::tailoring::NewTailoredResume;
use crate::pipeline::events::{EventTransport, RunEmitter};
use crate::pipeline::prompts::{TAILOR_PROMPT_TEMPLATE, TAILOR_SYSTEM};
use crate::pipeline::state::Stage;
use crate::store::ResultStore;
use crate::tools::{
    CompanyResearch, EnrichmentTools, FormatSpec, MetricsContext, ParsedResume, RelevancyScore,
    ResumeSection, ToolError, ValidationReport,
};

/// Relevancy assumed for the original resume when the baseline call fails.
pub const DEFAULT_BASELINE_SCORE: u32 = 50;

const GENERATION_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("Generated output could not be parsed")]
    UnparseableOutput,

    #[error("Request timed out after {0}s")]
    Timeout(u64),
}

impl PipelineError {
    /// Whether the client should offer a retry. Only upstream rate limiting
    /// and our own timeout qualify.
    pub fn can_retry(&self) -> bool {
        match self {
            PipelineError::Generation(e) => e.is_rate_limited(),
            PipelineError::UnparseableOutput => false,
            PipelineError::Timeout(_) => true,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Generation(e) if e.is_rate_limited() => {
                "The AI service is busy right now. Please try again in a minute.".to_string()
            }
            PipelineError::Generation(_) | PipelineError::UnparseableOutput => {
                "Failed to generate a tailored resume. Please try again.".to_string()
            }
            PipelineError::Timeout(_) => "Request timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailoringRequest {
    pub resume: String,
    pub job_description: String,
    pub model_key: String,
    /// Caller fingerprint, stored alongside the result.
    pub fingerprint: String,
}

/// Payload of the `complete` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailoringResult {
    pub tailored_resume: String,
    pub match_score: u32,
    pub baseline_score: u32,
    pub improvement: i32,
    pub keywords: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub missing_keywords: Vec<String>,
    pub validation: ValidationReport,
    pub format_spec: FormatSpec,
    pub changes: Vec<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub resume_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Box<TailoringResult>),
    Failed(PipelineError),
    Aborted,
}

/// Results of the preprocessing fan-out, defaults already applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Enrichment {
    pub keywords: Vec<String>,
    pub parsed_resume: ParsedResume,
    pub company_research: Option<CompanyResearch>,
    pub metrics_context: Option<MetricsContext>,
}

enum Halt {
    Aborted,
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(e: PipelineError) -> Self {
        Halt::Failed(e)
    }
}

pub struct TailoringPipeline {
    generator: Arc<dyn TextGenerator>,
    tools: Arc<dyn EnrichmentTools>,
    store: Arc<dyn ResultStore>,
    timeout: Duration,
}

fn or_default<T>(what: &str, result: Result<T, ToolError>, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{what} failed, using default: {e}");
            fallback
        }
    }
}

async fn announce<T: EventTransport>(
    emitter: &mut RunEmitter<T>,
    stage: Stage,
    progress: u8,
    message: &str,
) -> Result<(), Halt> {
    if emitter.status(stage, progress, message).await {
        Ok(())
    } else {
        Err(Halt::Aborted)
    }
}

impl TailoringPipeline {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        tools: Arc<dyn EnrichmentTools>,
        store: Arc<dyn ResultStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            tools,
            store,
            timeout,
        }
    }

    /// Runs the whole pipeline under the wall-clock ceiling and writes exactly
    /// one terminal event, unless the client has already gone.
    pub async fn run<T: EventTransport>(
        &self,
        request: TailoringRequest,
        emitter: &mut RunEmitter<T>,
    ) -> RunOutcome {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.execute(&request, emitter)).await;

        let outcome = match outcome {
            Ok(Ok(result)) => {
                if emitter.complete(result.clone()).await {
                    RunOutcome::Completed(Box::new(result))
                } else {
                    RunOutcome::Aborted
                }
            }
            Ok(Err(Halt::Aborted)) => RunOutcome::Aborted,
            Ok(Err(Halt::Failed(e))) => {
                emitter.fail(&e.user_message(), e.can_retry()).await;
                RunOutcome::Failed(e)
            }
            Err(_) => {
                let e = PipelineError::Timeout(self.timeout.as_secs());
                if let Some(stage) = emitter.state().stage() {
                    warn!(stage = ?stage, "Tailoring run timed out mid-phase");
                }
                emitter.fail(&e.user_message(), e.can_retry()).await;
                RunOutcome::Failed(e)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            RunOutcome::Completed(result) => info!(
                model = %request.model_key,
                fingerprint = %request.fingerprint,
                elapsed_ms,
                match_score = result.match_score,
                resume_id = ?result.resume_id,
                "Tailoring run completed"
            ),
            RunOutcome::Failed(e) => error!(
                model = %request.model_key,
                fingerprint = %request.fingerprint,
                elapsed_ms,
                can_retry = e.can_retry(),
                "Tailoring run failed: {e}"
            ),
            RunOutcome::Aborted => info!(
                model = %request.model_key,
                fingerprint = %request.fingerprint,
                elapsed_ms,
                "Tailoring run aborted; client disconnected"
            ),
        }
        outcome
    }

    async fn execute<T: EventTransport>(
        &self,
        request: &TailoringRequest,
        emitter: &mut RunEmitter<T>,
    ) -> Result<TailoringResult, Halt> {
        // Preprocessing
        announce(
            emitter,
            Stage::Preprocessing,
            10,
            "Analyzing the job description and your resume...",
        )
        .await?;
        let enrichment = self.preprocess(request).await;

        // Baseline
        announce(emitter, Stage::Scoring, 20, "Scoring your current resume...").await?;
        let baseline = self.baseline(request, &enrichment.keywords).await;

        // Generation
        announce(
            emitter,
            Stage::Generating,
            35,
            "Preparing tailoring instructions...",
        )
        .await?;
        let prompt = build_tailoring_prompt(request, &enrichment, &baseline);

        announce(
            emitter,
            Stage::Generating,
            40,
            "Generating your tailored resume...",
        )
        .await?;
        let options = GenerationOptions {
            system: TAILOR_SYSTEM,
            max_tokens: None,
            temperature: GENERATION_TEMPERATURE,
        };
        let generation = self
            .generator
            .generate(&prompt, &request.model_key, &options)
            .await
            .map_err(PipelineError::from)?;

        // Processing
        announce(
            emitter,
            Stage::Processing,
            60,
            "Processing the generated resume...",
        )
        .await?;
        let generated = parse_generation(&generation.text)
            .into_resume()
            .ok_or(PipelineError::UnparseableOutput)?;

        for (index, section) in resume_sections(&generated).iter().enumerate() {
            if !emitter.section(index, &section.title, &section.content).await {
                return Err(Halt::Aborted);
            }
        }

        // Post-processing
        announce(
            emitter,
            Stage::PostScoring,
            80,
            "Scoring the tailored resume and checking accuracy...",
        )
        .await?;
        let (post_score, validation) = self
            .post_process(request, &generated, &enrichment.keywords, &baseline)
            .await;

        announce(
            emitter,
            Stage::PostScoring,
            90,
            "Choosing the best format...",
        )
        .await?;
        let format_spec = or_default(
            "Format recommendation",
            self.tools
                .recommend_format(&generated.tailored_resume, &request.job_description)
                .await,
            FormatSpec::default(),
        );

        let mut result = TailoringResult {
            tailored_resume: generated.tailored_resume,
            match_score: post_score.score,
            baseline_score: baseline.score,
            improvement: post_score.score as i32 - baseline.score as i32,
            keywords: enrichment.keywords,
            matched_keywords: post_score.matched_keywords,
            missing_keywords: post_score.missing_keywords,
            validation,
            format_spec,
            changes: generated.changes,
            model: request.model_key.clone(),
            usage: generation.usage,
            resume_id: None,
        };

        if !emitter.is_open() {
            return Err(Halt::Aborted);
        }
        result.resume_id = self.persist(request, &result).await;

        Ok(result)
    }

    /// Four independent enrichment calls, run concurrently.
    pub async fn preprocess(&self, request: &TailoringRequest) -> Enrichment {
        let (keywords, parsed_resume, company_research, metrics_context) = tokio::join!(
            self.tools.extract_keywords(&request.job_description),
            self.tools.parse_resume(&request.resume),
            self.tools.research_company(&request.job_description),
            self.tools.metrics_context(&request.resume),
        );

        Enrichment {
            keywords: or_default("Keyword extraction", keywords, Vec::new()),
            parsed_resume: or_default("Resume parsing", parsed_resume, ParsedResume::default()),
            company_research: or_default("Company research", company_research, None),
            metrics_context: or_default("Metrics context", metrics_context, None),
        }
    }

    async fn baseline(&self, request: &TailoringRequest, keywords: &[String]) -> RelevancyScore {
        let result = self
            .tools
            .score_relevancy(&request.resume, &request.job_description, keywords)
            .await;
        or_default(
            "Baseline scoring",
            result,
            RelevancyScore {
                score: DEFAULT_BASELINE_SCORE,
                matched_keywords: vec![],
                missing_keywords: keywords.to_vec(),
            },
        )
    }

    /// Re-scoring and fabrication validation, run concurrently.
    async fn post_process(
        &self,
        request: &TailoringRequest,
        generated: &GeneratedResume,
        keywords: &[String],
        baseline: &RelevancyScore,
    ) -> (RelevancyScore, ValidationReport) {
        let (score, validation) = tokio::join!(
            self.tools.score_relevancy(
                &generated.tailored_resume,
                &request.job_description,
                keywords
            ),
            self.tools
                .validate(&request.resume, &generated.tailored_resume),
        );

        (
            or_default("Relevancy re-scoring", score, baseline.clone()),
            or_default(
                "Fabrication validation",
                validation,
                ValidationReport::unverified(),
            ),
        )
    }

    /// Best-effort write. A failure is logged and the run carries on.
    async fn persist(&self, request: &TailoringRequest, result: &TailoringResult) -> Option<Uuid> {
        let payload = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize tailoring result for storage: {e}");
                return None;
            }
        };

        let record = NewTailoredResume {
            fingerprint: request.fingerprint.clone(),
            model: request.model_key.clone(),
            job_description: request.job_description.clone(),
            original_resume: request.resume.clone(),
            tailored_resume: result.tailored_resume.clone(),
            match_score: result.match_score as i32,
            baseline_score: result.baseline_score as i32,
            payload,
        };

        match self.store.save(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to save tailored resume: {e:#}");
                None
            }
        }
    }
}

fn to_pretty_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").ok()).as_ref()
}

/// Replaces every `{name}` in `template` with `lookup(name)` in a single pass.
/// Inserted values are never rescanned; unknown names are left as written.
fn fill_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let Some(re) = placeholder_regex() else {
        error!("Prompt placeholder pattern failed to compile");
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Fills the generation template with the request and enrichment results.
pub fn build_tailoring_prompt(
    request: &TailoringRequest,
    enrichment: &Enrichment,
    baseline: &RelevancyScore,
) -> String {
    let missing = if baseline.missing_keywords.is_empty() {
        "none identified".to_string()
    } else {
        baseline.missing_keywords.join(", ")
    };

    fill_template(TAILOR_PROMPT_TEMPLATE, |name| match name {
        "honesty_instruction" => Some(HONESTY_INSTRUCTION.to_string()),
        "keywords_json" => Some(to_pretty_json(&enrichment.keywords)),
        "parsed_resume_json" => Some(to_pretty_json(&enrichment.parsed_resume)),
        "company_json" => Some(to_pretty_json(&enrichment.company_research)),
        "metrics_json" => Some(to_pretty_json(&enrichment.metrics_context)),
        "baseline_score" => Some(baseline.score.to_string()),
        "missing_keywords" => Some(missing.clone()),
        "job_description" => Some(request.job_description.clone()),
        "resume" => Some(request.resume.clone()),
        _ => None,
    })
}

/// Sections for `section` events: the model's own list, else the markdown headings.
fn resume_sections(generated: &GeneratedResume) -> Vec<ResumeSection> {
    if !generated.sections.is_empty() {
        return generated.sections.clone();
    }
    split_markdown_sections(&generated.tailored_resume)
}

fn split_markdown_sections(text: &str) -> Vec<ResumeSection> {
    let mut sections = Vec::new();
    let mut current: Option<ResumeSection> = None;

    for line in text.lines() {
        if let Some(heading) = line.trim_start().strip_prefix('#') {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some(ResumeSection {
                title: heading.trim_start_matches('#').trim().to_string(),
                content: String::new(),
            });
            continue;
        }

        match current.as_mut() {
            Some(section) => {
                if !section.content.is_empty() {
                    section.content.push('\n');
                }
                section.content.push_str(line);
            }
            None if !line.trim().is_empty() => {
                current = Some(ResumeSection {
                    title: String::new(),
                    content: line.to_string(),
                });
            }
            None => {}
        }
    }
    sections.extend(current);

    for section in &mut sections {
        section.content = section.content.trim().to_string();
    }
    sections
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm_client::Generation;
    use crate::pipeline::events::tests::MockTransport;
    use crate::pipeline::events::PipelineEvent;
    use crate::pipeline::state::RunState;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GENERATED: &str = r##"{"tailoredResume": "Jane Doe\n\n## Experience\n- Built Rust services\n\n## Skills\nRust, Tokio", "changes": ["Led with Rust"]}"##;

    pub(crate) struct FakeGenerator {
        response: Result<String, u16>,
        delay: Option<Duration>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeGenerator {
        pub(crate) fn ok() -> Self {
            Self {
                response: Ok(GENERATED.to_string()),
                delay: None,
                prompts: Mutex::new(vec![]),
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                response: Err(status),
                delay: None,
                prompts: Mutex::new(vec![]),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(
            &self,
            prompt: &str,
            _model_key: &str,
            _options: &GenerationOptions<'_>,
        ) -> Result<Generation, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.response {
                Ok(text) => Ok(Generation {
                    text: text.clone(),
                    usage: Some(Usage {
                        input_tokens: 900,
                        output_tokens: 400,
                    }),
                }),
                Err(status) => Err(LlmError::Api {
                    status: *status,
                    message: "upstream said no".to_string(),
                    retry_after: None,
                }),
            }
        }
    }

    /// Enrichment tools that either all succeed or all fail.
    pub(crate) struct FakeTools {
        fail: bool,
        relevancy_calls: AtomicUsize,
    }

    impl FakeTools {
        pub(crate) fn new(fail: bool) -> Self {
            Self {
                fail,
                relevancy_calls: AtomicUsize::new(0),
            }
        }

        fn check(&self, tool: &'static str) -> Result<(), ToolError> {
            if self.fail {
                Err(ToolError::Status { tool, status: 503 })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EnrichmentTools for FakeTools {
        async fn extract_keywords(&self, _jd: &str) -> Result<Vec<String>, ToolError> {
            self.check("extract-keywords")?;
            Ok(vec!["Rust".to_string(), "Kubernetes".to_string()])
        }

        async fn parse_resume(&self, _resume: &str) -> Result<ParsedResume, ToolError> {
            self.check("parse-resume")?;
            Ok(ParsedResume {
                name: Some("Jane Doe".to_string()),
                sections: vec![],
                skills: vec!["Rust".to_string()],
            })
        }

        async fn research_company(&self, _jd: &str) -> Result<Option<CompanyResearch>, ToolError> {
            self.check("company-research")?;
            Ok(Some(CompanyResearch {
                company: Some("Acme".to_string()),
                summary: "Builds rockets".to_string(),
                values: vec![],
            }))
        }

        async fn metrics_context(&self, _resume: &str) -> Result<Option<MetricsContext>, ToolError> {
            self.check("metrics-context")?;
            Ok(None)
        }

        async fn score_relevancy(
            &self,
            _resume: &str,
            _jd: &str,
            _keywords: &[String],
        ) -> Result<RelevancyScore, ToolError> {
            self.check("relevancy-score")?;
            let call = self.relevancy_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RelevancyScore {
                score: if call == 0 { 55 } else { 82 },
                matched_keywords: vec!["Rust".to_string()],
                missing_keywords: vec!["Kubernetes".to_string()],
            })
        }

        async fn validate(&self, _o: &str, _t: &str) -> Result<ValidationReport, ToolError> {
            self.check("validate")?;
            Ok(ValidationReport {
                passed: true,
                issues: vec![],
                verified: true,
            })
        }

        async fn recommend_format(&self, _t: &str, _jd: &str) -> Result<FormatSpec, ToolError> {
            self.check("format-recommendation")?;
            Ok(FormatSpec {
                layout: "two-column".to_string(),
                ..FormatSpec::default()
            })
        }
    }

    pub(crate) struct FakeStore {
        fail: bool,
        saved: Mutex<Vec<NewTailoredResume>>,
    }

    impl FakeStore {
        pub(crate) fn new(fail: bool) -> Self {
            Self {
                fail,
                saved: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ResultStore for FakeStore {
        async fn save(&self, record: &NewTailoredResume) -> anyhow::Result<Uuid> {
            if self.fail {
                return Err(anyhow!("database unavailable"));
            }
            self.saved.lock().unwrap().push(record.clone());
            Ok(Uuid::new_v4())
        }
    }

    fn request() -> TailoringRequest {
        TailoringRequest {
            resume: "Jane Doe. Rust engineer with five years building services.".to_string(),
            job_description: "Senior Rust engineer. Kubernetes a plus.".to_string(),
            model_key: "default".to_string(),
            fingerprint: "abc123".to_string(),
        }
    }

    fn pipeline(
        generator: Arc<FakeGenerator>,
        tools: Arc<FakeTools>,
        store: Arc<FakeStore>,
    ) -> TailoringPipeline {
        TailoringPipeline::new(generator, tools, store, Duration::from_secs(60))
    }

    fn complete_payload(transport: &MockTransport) -> Option<TailoringResult> {
        transport.events.lock().unwrap().iter().find_map(|e| match e {
            PipelineEvent::Complete(r) => Some((**r).clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_happy_path_emits_ordered_progress_then_complete() {
        let generator = Arc::new(FakeGenerator::ok());
        let store = Arc::new(FakeStore::new(false));
        let pipeline = pipeline(generator, Arc::new(FakeTools::new(false)), store.clone());
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(transport.progress_values(), vec![10, 20, 35, 40, 60, 80, 90]);
        assert_eq!(transport.names().last(), Some(&"complete"));
        assert_eq!(
            transport.names().iter().filter(|n| **n == "complete").count(),
            1
        );
        assert_eq!(emitter.state(), RunState::Completed);

        let result = complete_payload(&transport).unwrap();
        assert_eq!(result.baseline_score, 55);
        assert_eq!(result.match_score, 82);
        assert_eq!(result.improvement, 27);
        assert_eq!(result.format_spec.layout, "two-column");
        assert_eq!(result.changes, vec!["Led with Rust"]);
        assert!(result.resume_id.is_some());
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sections_follow_processing_and_precede_post_scoring() {
        let pipeline = pipeline(
            Arc::new(FakeGenerator::ok()),
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(false)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        pipeline.run(request(), &mut emitter).await;

        let events = transport.events.lock().unwrap();
        let titles: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Section(s) => Some(s.title.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec!["", "Experience", "Skills"]);

        let first_section = events
            .iter()
            .position(|e| matches!(e, PipelineEvent::Section(_)))
            .unwrap();
        assert!(matches!(&events[first_section - 1], PipelineEvent::Status(s) if s.progress == 60));
        assert!(matches!(&events[first_section + 3], PipelineEvent::Status(s) if s.progress == 80));
    }

    #[tokio::test]
    async fn test_all_enrichment_failures_still_reach_generation_with_defaults() {
        let generator = Arc::new(FakeGenerator::ok());
        let pipeline = pipeline(
            generator.clone(),
            Arc::new(FakeTools::new(true)),
            Arc::new(FakeStore::new(false)),
        );

        let enrichment = pipeline.preprocess(&request()).await;
        assert_eq!(enrichment, Enrichment::default());
        assert!(enrichment.keywords.is_empty());
        assert!(enrichment.company_research.is_none());
        assert!(enrichment.metrics_context.is_none());

        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(generator.calls(), 1);
        let prompt = generator.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("COMPANY RESEARCH:\nnull"));
        assert!(prompt.contains("currently scores 50/100"));

        let result = complete_payload(&transport).unwrap();
        assert_eq!(result.baseline_score, DEFAULT_BASELINE_SCORE);
        assert_eq!(result.match_score, DEFAULT_BASELINE_SCORE);
        assert!(!result.validation.verified);
        assert_eq!(result.format_spec, FormatSpec::default());
    }

    #[tokio::test]
    async fn test_progress_is_non_decreasing() {
        let pipeline = pipeline(
            Arc::new(FakeGenerator::ok()),
            Arc::new(FakeTools::new(true)),
            Arc::new(FakeStore::new(true)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        pipeline.run(request(), &mut emitter).await;

        let progress = transport.progress_values();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    }

    #[tokio::test]
    async fn test_generation_failure_emits_single_error() {
        let pipeline = pipeline(
            Arc::new(FakeGenerator::failing(500)),
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(false)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::Generation(_))));
        assert_eq!(
            transport.names(),
            vec!["status", "status", "status", "status", "error"]
        );
        let events = transport.events.lock().unwrap();
        match events.last() {
            Some(PipelineEvent::Error(e)) => assert!(!e.can_retry),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_generation_can_retry() {
        let pipeline = pipeline(
            Arc::new(FakeGenerator::failing(429)),
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(false)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        pipeline.run(request(), &mut emitter).await;

        let events = transport.events.lock().unwrap();
        assert!(matches!(events.last(), Some(PipelineEvent::Error(e)) if e.can_retry));
    }

    #[tokio::test]
    async fn test_unparseable_generation_is_fatal() {
        let generator = Arc::new(FakeGenerator {
            response: Ok("Sorry, I can't do that.".to_string()),
            delay: None,
            prompts: Mutex::new(vec![]),
        });
        let pipeline = pipeline(
            generator,
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(false)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;
        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::UnparseableOutput)));
        assert_eq!(transport.names().last(), Some(&"error"));
    }

    #[tokio::test]
    async fn test_persistence_failure_still_completes_without_id() {
        let pipeline = pipeline(
            Arc::new(FakeGenerator::ok()),
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(true)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Completed(_)));
        let result = complete_payload(&transport).unwrap();
        assert_eq!(result.resume_id, None);
        assert!(!result.tailored_resume.is_empty());
    }

    #[tokio::test]
    async fn test_abort_stops_all_writes_and_later_phases() {
        let generator = Arc::new(FakeGenerator::ok());
        let store = Arc::new(FakeStore::new(false));
        let pipeline = pipeline(generator.clone(), Arc::new(FakeTools::new(false)), store.clone());
        // Client disconnects right after the second status event.
        let transport = MockTransport::closing_after(2);
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Aborted));
        assert_eq!(transport.events.lock().unwrap().len(), 2);
        assert_eq!(generator.calls(), 0);
        assert!(store.saved.lock().unwrap().is_empty());
        assert_eq!(emitter.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_during_generation_discards_result() {
        let generator = Arc::new(FakeGenerator::ok());
        let store = Arc::new(FakeStore::new(false));
        let pipeline = pipeline(generator.clone(), Arc::new(FakeTools::new(false)), store.clone());
        // Closes once the 40% event is out, while the generator is running.
        let transport = MockTransport::closing_after(4);
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Aborted));
        assert_eq!(generator.calls(), 1);
        assert!(store.saved.lock().unwrap().is_empty());
        assert_eq!(transport.progress_values(), vec![10, 20, 35, 40]);
        assert!(!transport.names().contains(&"complete"));
        assert!(!transport.names().contains(&"section"));
        assert_eq!(emitter.state(), RunState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_emits_retryable_error() {
        let generator = Arc::new(FakeGenerator {
            response: Ok(GENERATED.to_string()),
            delay: Some(Duration::from_secs(120)),
            prompts: Mutex::new(vec![]),
        });
        let pipeline = pipeline(
            generator,
            Arc::new(FakeTools::new(false)),
            Arc::new(FakeStore::new(false)),
        );
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());

        let outcome = pipeline.run(request(), &mut emitter).await;

        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::Timeout(60))));
        let events = transport.events.lock().unwrap();
        match events.last() {
            Some(PipelineEvent::Error(e)) => {
                assert_eq!(e.error, "Request timed out");
                assert!(e.can_retry);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Complete(_))));
    }

    #[test]
    fn test_prompt_keeps_user_text_verbatim() {
        let mut req = request();
        req.resume = "Uses {keywords_json} literally".to_string();
        let prompt = build_tailoring_prompt(
            &req,
            &Enrichment::default(),
            &RelevancyScore {
                score: 61,
                matched_keywords: vec![],
                missing_keywords: vec!["Go".to_string()],
            },
        );
        assert!(prompt.contains("Uses {keywords_json} literally"));
        assert!(prompt.contains("scores 61/100"));
        assert!(prompt.contains("missing: Go"));
        assert!(prompt.contains(HONESTY_INSTRUCTION));
    }

    #[test]
    fn test_prompt_never_rescans_inserted_text() {
        let mut req = request();
        req.job_description = "Send your {resume} to jobs@acme.test".to_string();
        req.resume = "RESUME-BODY mentions {job_description}".to_string();
        let enrichment = Enrichment {
            keywords: vec!["{job_description}".to_string(), "{metrics_json}".to_string()],
            ..Enrichment::default()
        };
        let prompt = build_tailoring_prompt(
            &req,
            &enrichment,
            &RelevancyScore {
                score: 50,
                matched_keywords: vec![],
                missing_keywords: vec!["{resume}".to_string()],
            },
        );

        assert!(prompt.contains("Send your {resume} to jobs@acme.test"));
        assert!(prompt.contains("RESUME-BODY mentions {job_description}"));
        assert!(prompt.contains("\"{job_description}\""));
        assert!(prompt.contains("\"{metrics_json}\""));
        assert!(prompt.contains("missing: {resume}"));
        assert_eq!(prompt.matches("RESUME-BODY").count(), 1);
    }

    #[test]
    fn test_fill_template_leaves_unknown_names() {
        let filled = fill_template("{a} and {b} and {A} and {}", |name| {
            (name == "a").then(|| "x{b}".to_string())
        });
        assert_eq!(filled, "x{b} and {b} and {A} and {}");
    }

    #[test]
    fn test_split_markdown_sections() {
        let sections = split_markdown_sections("# Jane\nEngineer\n\n## Experience\n- A\n- B\n");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Jane");
        assert_eq!(sections[0].content, "Engineer");
        assert_eq!(sections[1].title, "Experience");
        assert_eq!(sections[1].content, "- A\n- B");
    }

    #[test]
    fn test_can_retry_only_for_rate_limits_and_timeouts() {
        let limited = PipelineError::Generation(LlmError::Api {
            status: 429,
            message: String::new(),
            retry_after: Some(10),
        });
        assert!(limited.can_retry());
        assert!(PipelineError::Timeout(60).can_retry());
        assert!(!PipelineError::UnparseableOutput.can_retry());
        assert!(!PipelineError::Generation(LlmError::EmptyContent).can_retry());
    }
}
