use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{token_hint, CallbackError, CallbackOutcome, ErrorInfo, TaskOutput, TaskTokenGateway};

/// Signal delivered to whoever is waiting on a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSignal {
    Success(TaskOutput),
    Failure(ErrorInfo),
}

#[derive(Debug)]
enum Slot {
    Pending(oneshot::Sender<TaskSignal>),
    Consumed,
}

/// A freshly issued token and the receiver its redemption will arrive on.
#[derive(Debug)]
pub struct PendingToken {
    pub token: String,
    pub receiver: oneshot::Receiver<TaskSignal>,
}

/// In-process token ledger standing in for the orchestration substrate.
#[derive(Debug)]
pub struct MemoryTaskTokenGateway {
    name: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryTaskTokenGateway {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token for a step that is about to suspend.
    pub fn issue(&self) -> PendingToken {
        let token = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(token.clone(), Slot::Pending(tx));
        }
        debug!(gateway = %self.name, token = %token_hint(&token), "Issued task token");
        PendingToken { token, receiver: rx }
    }

    /// Drop a token whose step was abandoned before it could be redeemed.
    /// Redeemed tokens are kept so late duplicates still read as consumed.
    pub fn release(&self, token: &str) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        match slots.get(token) {
            Some(Slot::Pending(_)) => {
                slots.remove(token);
                debug!(gateway = %self.name, token = %token_hint(token), "Released task token");
                true
            }
            _ => false,
        }
    }

    pub fn is_consumed(&self, token: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| matches!(slots.get(token), Some(Slot::Consumed)))
            .unwrap_or(false)
    }

    pub fn outstanding(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| matches!(s, Slot::Pending(_))).count())
            .unwrap_or(0)
    }

    fn redeem(&self, token: &str, signal: TaskSignal) -> Result<CallbackOutcome, CallbackError> {
        let mut slots = self.slots.lock().map_err(|_| CallbackError::Substrate {
            message: "token ledger lock poisoned".to_string(),
        })?;

        let slot = slots.get_mut(token).ok_or_else(|| CallbackError::InvalidToken {
            token_hint: token_hint(token),
        })?;

        match std::mem::replace(slot, Slot::Consumed) {
            Slot::Consumed => {
                info!(
                    gateway = %self.name,
                    token = %token_hint(token),
                    "Task token already consumed"
                );
                Ok(CallbackOutcome::TokenAlreadyConsumed)
            }
            Slot::Pending(sender) => {
                if sender.send(signal).is_err() {
                    warn!(
                        gateway = %self.name,
                        token = %token_hint(token),
                        "Task token redeemed after its step stopped waiting"
                    );
                    return Err(CallbackError::TaskTimedOut {
                        token_hint: token_hint(token),
                    });
                }
                Ok(CallbackOutcome::Accepted)
            }
        }
    }
}

#[async_trait]
impl TaskTokenGateway for MemoryTaskTokenGateway {
    async fn complete(
        &self,
        token: &str,
        output: TaskOutput,
    ) -> Result<CallbackOutcome, CallbackError> {
        self.redeem(token, TaskSignal::Success(output))
    }

    async fn fail(&self, token: &str, error: ErrorInfo) -> Result<CallbackOutcome, CallbackError> {
        self.redeem(token, TaskSignal::Failure(error))
    }
}
