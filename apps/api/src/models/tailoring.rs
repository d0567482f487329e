use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Insert-only record of one completed tailoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTailoredResume {
    pub fingerprint: String,
    pub model: String,
    pub job_description: String,
    pub original_resume: String,
    pub tailored_resume: String,
    pub match_score: i32,
    pub baseline_score: i32,
    /// The full `complete` payload.
    pub payload: Value,
}
