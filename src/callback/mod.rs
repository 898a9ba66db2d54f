//! Task token callback gateway
//!
//! Resuming a suspended step is reduced to two calls: `complete` and `fail`.
//! Exactly one of them must be invoked per suspended step. A second
//! redemption is reported as [`CallbackOutcome::TokenAlreadyConsumed`], which
//! callers treat as a no-op under at-least-once delivery.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::{ErrorSummary, TaskType, WorkflowPayload};
use crate::pipeline::StepOutcome;

pub use memory::{MemoryTaskTokenGateway, PendingToken, TaskSignal};

/// Output handed back to the orchestration substrate on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub payload: WorkflowPayload,
    pub outcome: StepOutcome,
}

/// Error handed back to the substrate on failure (`error` + `cause`, as
/// step-function style task failures carry them).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error: String,
    pub cause: String,
}

impl ErrorInfo {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn into_summary(self, failed_step: Option<TaskType>) -> ErrorSummary {
        ErrorSummary {
            error: self.error,
            cause: self.cause,
            failed_step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Accepted,
    TokenAlreadyConsumed,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Unknown task token {token_hint}")]
    InvalidToken { token_hint: String },
    #[error("Task for token {token_hint} already timed out")]
    TaskTimedOut { token_hint: String },
    #[error("Orchestration substrate error: {message}")]
    Substrate { message: String },
}

/// Short, non-redeemable prefix of a token for log lines.
pub fn token_hint(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

#[async_trait]
pub trait TaskTokenGateway: Send + Sync {
    async fn complete(
        &self,
        token: &str,
        output: TaskOutput,
    ) -> Result<CallbackOutcome, CallbackError>;

    async fn fail(&self, token: &str, error: ErrorInfo) -> Result<CallbackOutcome, CallbackError>;
}
