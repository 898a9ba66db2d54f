//! Bus-side consumers that turn relay events into pipeline actions.
//!
//! Delivery is at-least-once. Each consumer remembers event ids it has
//! already dispatched; redelivery of a dispatched event is a no-op, and a
//! second completion for the same hub step is absorbed by the gateway's
//! `TokenAlreadyConsumed`.

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::events::{CompletionDetail, HandoffDetail, RelayEnvelope, RelayEvent};
use crate::callback::{CallbackError, CallbackOutcome, ErrorInfo, TaskOutput, TaskTokenGateway};
use crate::config::RelayConfig;
use crate::context::ProvisionerContext;
use crate::handlers::{HandlerError, StartHandler};
use crate::payload::{TaskType, ValidationError, WorkflowPayload};
use crate::pipeline::{ExecutorError, PipelineLauncher, StepOutcome};
use crate::store::{redact_url, RetrievalError, StoreError};
use crate::telemetry::create_workflow_span;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Payload retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("Payload store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid relayed payload: {0}")]
    Validation(#[from] ValidationError),
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("Handler error: {0}")]
    Handler(HandlerError),
    #[error("Launch failed: {0}")]
    Launch(#[from] ExecutorError),
}

impl From<HandlerError> for RelayError {
    fn from(error: HandlerError) -> Self {
        match error {
            HandlerError::Retrieval(e) => RelayError::Retrieval(e),
            HandlerError::Validation(e) => RelayError::Validation(e),
            other => RelayError::Handler(other),
        }
    }
}

impl RelayError {
    /// The producer may fix this by publishing again with a fresh URL.
    pub fn is_reissuable(&self) -> bool {
        matches!(self, RelayError::Retrieval(e) if e.is_reissuable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDisposition {
    Dispatched,
    /// Already handled: a redelivered event id or an already-redeemed token.
    Duplicate,
    Ignored,
}

#[async_trait]
pub trait RelayConsumer: Send + Sync {
    async fn handle(&self, envelope: RelayEnvelope) -> Result<RelayDisposition, RelayError>;
}

fn seen_events(config: &RelayConfig) -> Cache<String, ()> {
    Cache::builder()
        .max_capacity(config.dedupe_capacity)
        .time_to_live(config.dedupe_ttl())
        .build()
}

fn log_unhandled(event: &RelayEvent, bus: &str) -> RelayDisposition {
    match event {
        RelayEvent::Unhandled {
            source,
            detail_type,
            reason,
        } => warn!(
            bus,
            source = %source,
            detail_type = %detail_type,
            reason = %reason,
            "Dropping unroutable event",
        ),
        other => warn!(bus, event = other.name(), "Event not meant for this bus"),
    }
    RelayDisposition::Ignored
}

/// Hub side: resumes the suspended SpokeHandoff step when the spoke reports.
pub struct HubRelayConsumer {
    ctx: Arc<ProvisionerContext>,
    gateway: Arc<dyn TaskTokenGateway>,
    seen: Cache<String, ()>,
}

impl HubRelayConsumer {
    pub fn new(ctx: Arc<ProvisionerContext>, gateway: Arc<dyn TaskTokenGateway>) -> Self {
        let seen = seen_events(&ctx.relay);
        Self { ctx, gateway, seen }
    }

    async fn resume(
        &self,
        detail: &CompletionDetail,
        succeeded: bool,
    ) -> Result<RelayDisposition, RelayError> {
        let payload: WorkflowPayload =
            self.ctx.fetcher.fetch(&detail.full_payload_signed_url).await?;
        if payload.asset_id != detail.asset_id {
            return Err(ValidationError::AssetIdChanged {
                expected: detail.asset_id.clone(),
                actual: payload.asset_id,
            }
            .into());
        }

        let run_id = detail
            .data_source_run_id
            .clone()
            .or_else(|| payload.execution.data_source_run_id.clone())
            .ok_or(ValidationError::MissingField("dataSourceRunId"))?;

        let stash = self.ctx.store.get(TaskType::SpokeHandoff, &run_id).await?;
        if stash.asset_id != payload.asset_id {
            return Err(ValidationError::AssetIdChanged {
                expected: stash.asset_id,
                actual: payload.asset_id,
            }
            .into());
        }
        let token = stash
            .execution
            .hub_task_token
            .ok_or(ValidationError::MissingField("execution.hubTaskToken"))?;

        let outcome = if succeeded {
            let mut resumed = payload;
            resumed.execution.task_token = Some(token.clone());
            resumed.execution.hub_task_token = None;
            self.gateway
                .complete(
                    &token,
                    TaskOutput {
                        payload: resumed,
                        outcome: StepOutcome::Succeeded,
                    },
                )
                .await?
        } else {
            let error = match payload.execution.error {
                Some(summary) => {
                    let cause = match summary.failed_step {
                        Some(step) => format!("spoke step {step}: {}", summary.cause),
                        None => summary.cause,
                    };
                    ErrorInfo::new(summary.error, cause)
                }
                None => ErrorInfo::new(
                    "EnrichmentFailed",
                    "spoke reported failure without an error summary",
                ),
            };
            self.gateway.fail(&token, error).await?
        };

        Ok(match outcome {
            CallbackOutcome::Accepted => {
                info!(run_id = %run_id, succeeded, "Resumed hub handoff step");
                RelayDisposition::Dispatched
            }
            CallbackOutcome::TokenAlreadyConsumed => {
                debug!(run_id = %run_id, "Hub handoff step already resumed");
                RelayDisposition::Duplicate
            }
        })
    }
}

#[async_trait]
impl RelayConsumer for HubRelayConsumer {
    async fn handle(&self, envelope: RelayEnvelope) -> Result<RelayDisposition, RelayError> {
        if self.seen.contains_key(&envelope.id) {
            debug!(event_id = %envelope.id, "Duplicate event delivery");
            return Ok(RelayDisposition::Duplicate);
        }

        let event = RelayEvent::classify(&envelope, &self.ctx.relay);
        let disposition = match &event {
            RelayEvent::EnrichmentCompleted(detail) | RelayEvent::EnrichmentFailed(detail) => {
                let succeeded = matches!(event, RelayEvent::EnrichmentCompleted(_));
                let span = create_workflow_span(
                    "hub_relay",
                    &detail.asset_id,
                    None,
                    Some(envelope.id.as_str()),
                );
                self.resume(detail, succeeded).instrument(span).await.inspect_err(|e| {
                    error!(
                        event_id = %envelope.id,
                        url = %redact_url(&detail.full_payload_signed_url),
                        reissuable = e.is_reissuable(),
                        error = %e,
                        "Failed to resume hub step"
                    )
                })?
            }
            other => log_unhandled(other, "hub"),
        };

        self.seen.insert(envelope.id, ()).await;
        Ok(disposition)
    }
}

/// Spoke side: starts a spoke execution for each handoff.
pub struct SpokeRelayConsumer {
    start: Arc<StartHandler>,
    launcher: Arc<dyn PipelineLauncher>,
    relay: RelayConfig,
    seen: Cache<String, ()>,
}

impl SpokeRelayConsumer {
    pub fn new(
        start: Arc<StartHandler>,
        launcher: Arc<dyn PipelineLauncher>,
        relay: RelayConfig,
    ) -> Self {
        let seen = seen_events(&relay);
        Self {
            start,
            launcher,
            relay,
            seen,
        }
    }

    async fn begin(&self, detail: &HandoffDetail) -> Result<RelayDisposition, RelayError> {
        let payload = self.start.start(detail).await?;
        let execution_id = self.launcher.launch(payload).await?;
        info!(
            execution_id = %execution_id,
            run_id = %detail.data_source_run_id,
            "Spoke execution launched",
        );
        Ok(RelayDisposition::Dispatched)
    }
}

#[async_trait]
impl RelayConsumer for SpokeRelayConsumer {
    async fn handle(&self, envelope: RelayEnvelope) -> Result<RelayDisposition, RelayError> {
        if self.seen.contains_key(&envelope.id) {
            debug!(event_id = %envelope.id, "Duplicate event delivery");
            return Ok(RelayDisposition::Duplicate);
        }

        let disposition = match RelayEvent::classify(&envelope, &self.relay) {
            RelayEvent::HandoffRequested(detail) => {
                let span = create_workflow_span(
                    "spoke_relay",
                    &detail.asset_id,
                    None,
                    Some(envelope.id.as_str()),
                );
                self.begin(&detail).instrument(span).await.inspect_err(|e| {
                    error!(
                        event_id = %envelope.id,
                        url = %redact_url(&detail.full_payload_signed_url),
                        reissuable = e.is_reissuable(),
                        error = %e,
                        "Failed to start spoke execution"
                    )
                })?
            }
            other => log_unhandled(&other, "spoke"),
        };

        self.seen.insert(envelope.id, ()).await;
        Ok(disposition)
    }
}

/// Feed every envelope from `receiver` to `consumer` until the bus closes.
pub fn spawn_pump(
    bus: impl Into<String>,
    mut receiver: mpsc::UnboundedReceiver<RelayEnvelope>,
    consumer: Arc<dyn RelayConsumer>,
) -> JoinHandle<()> {
    let bus = bus.into();
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            let event_id = envelope.id.clone();
            match consumer.handle(envelope).await {
                Ok(disposition) => debug!(
                    bus = %bus,
                    event_id = %event_id,
                    ?disposition,
                    "Event consumed",
                ),
                Err(e) => warn!(bus = %bus, event_id = %event_id, error = %e, "Event not consumed"),
            }
        }
        debug!(bus = %bus, "Relay pump stopped");
    })
}
