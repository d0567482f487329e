// Streaming tailoring pipeline.
// Flow: preprocessing fan-out → baseline score → generation → parse + sections →
//       post-scoring fan-out → format recommendation → persist → complete.
// Only generation can fail a run; every other collaborator has a fallback.

pub mod events;
pub mod prompts;
pub mod runner;
pub mod state;

pub use events::{PipelineEvent, RunEmitter};
pub use runner::{TailoringPipeline, TailoringRequest, TailoringResult};
