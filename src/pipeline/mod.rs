//! Hub and spoke pipelines
//!
//! Each pipeline is a static transition table keyed by `(state, outcome)`.
//! Sequencing lives in the external orchestration substrate; the
//! [`LocalExecutor`] here reproduces it in-process for local runs and tests.

pub mod executor;
pub mod transitions;

pub use executor::{ExecutionReport, ExecutorError, LocalExecutor, PipelineLauncher};
pub use transitions::{
    hub_pipeline, spoke_pipeline, PipelineDefinition, PipelineError, PipelineKind, StepOutcome,
    Transition,
};
