//! Explicit transition tables for the hub and spoke pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::payload::TaskType;

/// What a step reported when it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Succeeded,
    /// Remote work is still in flight; the step will be visited again.
    Running,
    /// The step does not apply to this payload.
    Skipped,
    Failed,
}

impl StepOutcome {
    pub const ALL: [StepOutcome; 4] = [
        StepOutcome::Succeeded,
        StepOutcome::Running,
        StepOutcome::Skipped,
        StepOutcome::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "SUCCEEDED",
            StepOutcome::Running => "RUNNING",
            StepOutcome::Skipped => "SKIPPED",
            StepOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Hub,
    Spoke,
}

impl PipelineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::Hub => "hub",
            PipelineKind::Spoke => "spoke",
        }
    }

    pub fn definition(self) -> PipelineDefinition {
        match self {
            PipelineKind::Hub => hub_pipeline(),
            PipelineKind::Spoke => spoke_pipeline(),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hub" => Ok(PipelineKind::Hub),
            "spoke" => Ok(PipelineKind::Spoke),
            other => Err(PipelineError::UnknownPipeline(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Unknown pipeline '{0}' (expected hub or spoke)")]
    UnknownPipeline(String),
    #[error("{pipeline} pipeline has no state {state}")]
    UnknownState { pipeline: PipelineKind, state: TaskType },
    #[error("{pipeline} pipeline has no transition from {state} on {outcome}")]
    NoTransition {
        pipeline: PipelineKind,
        state: TaskType,
        outcome: StepOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: TaskType,
    pub on: StepOutcome,
    pub to: TaskType,
}

const fn t(from: TaskType, on: StepOutcome, to: TaskType) -> Transition {
    Transition { from, on, to }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub kind: PipelineKind,
    pub initial: TaskType,
    pub transitions: Vec<Transition>,
}

impl PipelineDefinition {
    /// Every state reachable in this pipeline, in table order, terminals last.
    pub fn states(&self) -> Vec<TaskType> {
        let mut states = vec![self.initial];
        for transition in &self.transitions {
            for state in [transition.from, transition.to] {
                if !state.is_terminal() && !states.contains(&state) {
                    states.push(state);
                }
            }
        }
        states.push(TaskType::Complete);
        states.push(TaskType::Failed);
        states
    }

    pub fn contains(&self, state: TaskType) -> bool {
        self.states().contains(&state)
    }

    /// States that revisit themselves while remote work is in flight.
    pub fn is_poll_state(&self, state: TaskType) -> bool {
        self.transitions
            .iter()
            .any(|tr| tr.from == state && tr.on == StepOutcome::Running && tr.to == state)
    }

    /// Next state after `state` reported `outcome`. `None` once terminal.
    pub fn next(
        &self,
        state: TaskType,
        outcome: StepOutcome,
    ) -> Result<Option<TaskType>, PipelineError> {
        if !self.contains(state) {
            return Err(PipelineError::UnknownState {
                pipeline: self.kind,
                state,
            });
        }
        if state.is_terminal() {
            return Ok(None);
        }
        if outcome == StepOutcome::Failed {
            return Ok(Some(TaskType::Failed));
        }
        self.transitions
            .iter()
            .find(|tr| tr.from == state && tr.on == outcome)
            .map(|tr| Some(tr.to))
            .ok_or(PipelineError::NoTransition {
                pipeline: self.kind,
                state,
                outcome,
            })
    }

    /// Human-readable transition table.
    pub fn render(&self) -> String {
        let mut out = format!("{} pipeline (initial: {})\n", self.kind, self.initial);
        for tr in &self.transitions {
            out.push_str(
                &format!("  {:<18} --{:<9}--> {}\n", tr.from.as_str(), tr.on.as_str(), tr.to),
            );
        }
        out.push_str("  *                  --FAILED   --> Failed\n");
        out
    }
}

pub fn hub_pipeline() -> PipelineDefinition {
    use StepOutcome::*;
    use TaskType as S;
    PipelineDefinition {
        kind: PipelineKind::Hub,
        initial: S::CreateProject,
        transitions: vec![
            t(S::CreateProject, Succeeded, S::CreateDataSource),
            t(S::CreateDataSource, Succeeded, S::RunDataSource),
            t(S::RunDataSource, Succeeded, S::VerifyDataSource),
            t(S::VerifyDataSource, Running, S::VerifyDataSource),
            t(S::VerifyDataSource, Succeeded, S::SpokeHandoff),
            t(S::SpokeHandoff, Succeeded, S::Complete),
        ],
    }
}

pub fn spoke_pipeline() -> PipelineDefinition {
    use StepOutcome::*;
    use TaskType as S;
    PipelineDefinition {
        kind: PipelineKind::Spoke,
        initial: S::Connection,
        transitions: vec![
            t(S::Connection, Succeeded, S::DataSet),
            t(S::Connection, Skipped, S::DataSet),
            t(S::DataSet, Succeeded, S::GlueCrawler),
            t(S::DataSet, Skipped, S::GlueCrawler),
            t(S::GlueCrawler, Running, S::GlueCrawler),
            t(S::GlueCrawler, Succeeded, S::ProfileDataSet),
            t(S::GlueCrawler, Skipped, S::ProfileDataSet),
            t(S::ProfileDataSet, Succeeded, S::ProfileJob),
            t(S::ProfileJob, Running, S::ProfileJob),
            t(S::ProfileJob, Succeeded, S::RecipeJob),
            t(S::RecipeJob, Running, S::RecipeJob),
            t(S::RecipeJob, Succeeded, S::Cleanup),
            t(S::RecipeJob, Skipped, S::Cleanup),
            t(S::Cleanup, Succeeded, S::SpokeResponse),
            t(S::SpokeResponse, Succeeded, S::Complete),
        ],
    }
}
