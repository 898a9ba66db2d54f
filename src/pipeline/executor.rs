//! In-process stand-in for the orchestration substrate.
//!
//! Drives one pipeline instance state by state: issue a token, run the
//! state's handler under it, wait for the token to be redeemed, then follow
//! the transition table. Used by the local topology and tests; production
//! sequencing and durability belong to the external substrate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, error, info, warn, Instrument};

use super::transitions::{PipelineDefinition, PipelineError, PipelineKind, StepOutcome};
use crate::callback::{ErrorInfo, MemoryTaskTokenGateway, PendingToken, TaskOutput, TaskSignal};
use crate::config::ExecutorConfig;
use crate::handlers::{run_task, HandlerSet, TaskDisposition};
use crate::payload::{ErrorSummary, TaskType, WorkflowPayload};
use crate::telemetry::{create_workflow_span, generate_correlation_id};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("No {pipeline} handler registered for state {state}")]
    MissingHandler { pipeline: PipelineKind, state: TaskType },
    #[error(
        "Terminal step {state} failed: {error}: {cause}",
        error = .error.error,
        cause = .error.cause,
    )]
    TerminalStepFailed { state: TaskType, error: ErrorInfo },
    #[error("Execution {execution_id} could not be launched: {message}")]
    Launch { execution_id: String, message: String },
}

/// Final state of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub pipeline: PipelineKind,
    pub final_state: TaskType,
    pub payload: WorkflowPayload,
    /// States in visit order, poll revisits included.
    pub visited: Vec<TaskType>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == TaskType::Complete
    }
}

/// Starts pipeline executions without waiting for them.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Returns the new execution's id.
    async fn launch(&self, payload: WorkflowPayload) -> Result<String, ExecutorError>;
}

enum StepResult {
    Output(TaskOutput),
    Failed(ErrorSummary),
    /// The payload was already terminal.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct LocalExecutor {
    definition: PipelineDefinition,
    handlers: HandlerSet,
    gateway: Arc<MemoryTaskTokenGateway>,
    config: ExecutorConfig,
    reports: Option<mpsc::UnboundedSender<Result<ExecutionReport, ExecutorError>>>,
}

impl LocalExecutor {
    pub fn new(
        handlers: HandlerSet,
        gateway: Arc<MemoryTaskTokenGateway>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            definition: handlers.kind().definition(),
            handlers,
            gateway,
            config,
            reports: None,
        }
    }

    /// Send the result of every launched execution to `sender`.
    pub fn with_reports(
        mut self,
        sender: mpsc::UnboundedSender<Result<ExecutionReport, ExecutorError>>,
    ) -> Self {
        self.reports = Some(sender);
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn gateway(&self) -> &Arc<MemoryTaskTokenGateway> {
        &self.gateway
    }

    /// Run one execution to a terminal state.
    pub async fn execute(
        &self,
        payload: WorkflowPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        let execution_id = generate_correlation_id();
        self.run(execution_id, payload).await
    }

    async fn run(
        &self,
        execution_id: String,
        payload: WorkflowPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        let span = create_workflow_span(
            "execute_pipeline",
            &payload.asset_id,
            None,
            Some(execution_id.as_str()),
        );
        async move {
            let kind = self.definition.kind;
            let mut state = self.definition.initial;
            let mut payload = payload;
            let mut visited = Vec::new();
            let mut transitions: u32 = 0;

            info!(pipeline = %kind, "Execution started");
            loop {
                visited.push(state);
                let (next_payload, outcome) = match self.run_step(state, payload.clone()).await? {
                    StepResult::Output(output) => (output.payload, output.outcome),
                    StepResult::Failed(summary) => {
                        if state.is_terminal() {
                            return Err(ExecutorError::TerminalStepFailed {
                                state,
                                error: ErrorInfo::new(summary.error, summary.cause),
                            });
                        }
                        warn!(state = %state, error = %summary.error, "Step failed");
                        payload.execution.error = Some(summary);
                        (payload, StepOutcome::Failed)
                    }
                    StepResult::Skipped => {
                        info!(state = %state, status = %payload.status, "Payload already terminal");
                        break;
                    }
                };
                payload = next_payload;

                let Some(mut next) = self.definition.next(state, outcome)? else {
                    break;
                };

                transitions += 1;
                if transitions >= self.config.max_transitions && !next.is_terminal() {
                    error!(
                        limit = self.config.max_transitions,
                        state = %state,
                        "Transition limit reached",
                    );
                    payload.execution.error = Some(ErrorSummary {
                        error: "States.TransitionLimitExceeded".to_string(),
                        cause: format!(
                            "execution exceeded {} transitions while in {state}",
                            self.config.max_transitions
                        ),
                        failed_step: Some(state),
                    });
                    next = TaskType::Failed;
                }

                if next == state {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                debug!(from = %state, to = %next, outcome = %outcome, "Transition");
                state = next;
            }

            info!(
                pipeline = %kind,
                final_state = %state,
                status = %payload.status,
                "Execution finished",
            );
            Ok(ExecutionReport {
                execution_id,
                pipeline: kind,
                final_state: state,
                payload,
                visited,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_step(
        &self,
        state: TaskType,
        payload: WorkflowPayload,
    ) -> Result<StepResult, ExecutorError> {
        let handler = self.handlers.get(state).ok_or(ExecutorError::MissingHandler {
            pipeline: self.definition.kind,
            state,
        })?;

        let mut delays = self.retry_delays();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let PendingToken { token, receiver } = self.gateway.issue();
            let mut input = payload.clone();
            input.execution.task_token = Some(token.clone());

            let error = match run_task(handler.as_ref(), self.gateway.as_ref(), input).await {
                Ok(TaskDisposition::Skipped { .. }) => {
                    self.gateway.release(&token);
                    return Ok(StepResult::Skipped);
                }
                Ok(_) => return Ok(self.await_signal(state, receiver).await),
                Err(e) => e,
            };
            self.gateway.release(&token);

            if !error.is_transient() {
                warn!(state = %state, attempt, error = %error, "Step error is not retryable");
                return Ok(StepResult::Failed(error.error_info().into_summary(Some(state))));
            }
            let Some(delay) = delays.next() else {
                warn!(
                    state = %state,
                    attempt,
                    error = %error,
                    "Transient step error, attempts exhausted",
                );
                return Ok(StepResult::Failed(error.error_info().into_summary(Some(state))));
            };
            warn!(
                state = %state,
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient step error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn await_signal(
        &self,
        state: TaskType,
        receiver: oneshot::Receiver<TaskSignal>,
    ) -> StepResult {
        match tokio::time::timeout(self.config.step_timeout(), receiver).await {
            Ok(Ok(TaskSignal::Success(output))) => StepResult::Output(output),
            Ok(Ok(TaskSignal::Failure(info))) => StepResult::Failed(info.into_summary(Some(state))),
            Ok(Err(_)) => StepResult::Failed(ErrorSummary {
                error: "States.Runtime".to_string(),
                cause: "task token was dropped without a signal".to_string(),
                failed_step: Some(state),
            }),
            Err(_) => {
                error!(state = %state, timeout = ?self.config.step_timeout(), "Step timed out");
                StepResult::Failed(ErrorSummary {
                    error: "States.Timeout".to_string(),
                    cause: format!(
                        "no callback within {}s",
                        self.config.step_timeout().as_secs_f64(),
                    ),
                    failed_step: Some(state),
                })
            }
        }
    }

    /// Delays between the attempts of one step: doubling from the base
    /// interval, capped, with full jitter. Yields `max_attempts - 1` delays.
    fn retry_delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.config.base_backoff_millis.div_ceil(2))
            .max_delay(self.config.max_backoff())
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1) as usize)
    }
}

#[async_trait]
impl PipelineLauncher for LocalExecutor {
    async fn launch(&self, payload: WorkflowPayload) -> Result<String, ExecutorError> {
        let execution_id = generate_correlation_id();
        let executor = self.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            let result = executor.run(id, payload).await;
            if let Err(e) = &result {
                error!(error = %e, "Launched execution ended with an error");
            }
            if let Some(reports) = &executor.reports {
                let _ = reports.send(result);
            }
        });
        info!(execution_id = %execution_id, pipeline = %self.definition.kind, "Execution launched");
        Ok(execution_id)
    }
}
