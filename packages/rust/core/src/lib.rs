//! Research orchestration for darkscout.
//!
//! This crate ties the crawler, the knowledge store, and a language model
//! together into the four-stage research pipeline, and exports its report.

pub mod export;
pub mod llm;
pub mod pipeline;

pub use export::{render_report, write_report};
pub use llm::{LanguageModelService, OpenRouterClient};
pub use pipeline::{
    PipelineOutcome, PipelineRun, PipelineState, ProgressReporter, ResearchOptions,
    SilentProgress, Stage, StageSnapshot, StateUpdate, parse_plan, resolve_target,
};
