// Prompt constants for the tailoring pipeline.
// Cross-cutting fragments come from llm_client::prompts.

/// System prompt for the generation call.
pub const TAILOR_SYSTEM: &str = "You are an expert resume writer and career strategist. \
    You rewrite resumes so they match a specific job description without inventing anything. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Generation prompt template. Every `{placeholder}` is replaced before sending.
pub const TAILOR_PROMPT_TEMPLATE: &str = r#"Tailor the resume below to the job description.

{honesty_instruction}

JOB DESCRIPTION:
{job_description}

ORIGINAL RESUME:
{resume}

TARGET KEYWORDS (work in the ones the resume genuinely supports):
{keywords_json}

STRUCTURED RESUME:
{parsed_resume_json}

COMPANY RESEARCH:
{company_json}

METRICS GUIDANCE:
{metrics_json}

The original resume currently scores {baseline_score}/100 for relevancy.
Keywords it is missing: {missing_keywords}

Return a JSON object with this EXACT schema:
{
  "tailoredResume": "the full tailored resume in markdown, one '## ' heading per section",
  "changes": ["short description of each significant change"],
  "sections": [
    {"title": "Experience", "content": "markdown content of the section"}
  ]
}"#;
