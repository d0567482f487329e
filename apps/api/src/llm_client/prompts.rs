// Shared prompt fragments. Pipeline-specific templates live in pipeline/prompts.rs.

/// Appended to every tailoring prompt.
pub const HONESTY_INSTRUCTION: &str = "\
    CRITICAL: Only use facts present in the original resume. \
    Do NOT invent employers, titles, dates, degrees, certifications or metrics. \
    You may reorder, rephrase and emphasise existing content to match the job description. \
    If a job requirement is not supported by the resume, leave it out.";
