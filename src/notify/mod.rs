//! Outbound notification capability.
//!
//! The SMS/email transport itself is an external collaborator; the engine
//! ends at the [`Messenger`] trait. [`MockMessenger`] records calls and can
//! script failures or hold sends open, which is what the dispatch and
//! concurrency tests are built on.

use async_trait::async_trait;

use crate::error::Result;

pub mod template;

pub use template::{MessageContext, MessageTemplates};

/// Receipt for an accepted outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-side message id.
    pub message_id: String,
}

/// Capability for delivering one message to one recipient.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver `body` to `to` (a phone contact).
    ///
    /// # Errors
    /// Returns an error when the provider rejects or cannot reach the
    /// recipient. Callers in a batch fan-out must contain this per donor.
    async fn send(&self, to: &str, body: &str) -> Result<SendReceipt>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Record of a call made to the mock messenger.
#[derive(Debug, Clone)]
pub struct MockSend {
    pub to: String,
    pub body: String,
}

/// A scripted outcome that can optionally wait for a trigger before
/// completing.
enum MockOutcome {
    Immediate(Result<SendReceipt>),
    Triggered {
        outcome: Result<SendReceipt>,
        trigger: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    },
}

/// Mock messenger for testing.
///
/// Outcomes are scripted per recipient in FIFO order; recipients with no
/// script get a generated success receipt.
#[derive(Clone, Default)]
pub struct MockMessenger {
    outcomes: Arc<Mutex<HashMap<String, Vec<MockOutcome>>>>,
    calls: Arc<Mutex<Vec<MockSend>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next outcome for a recipient.
    pub fn add_outcome(&self, to: &str, outcome: Result<SendReceipt>) {
        self.outcomes
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(MockOutcome::Immediate(outcome));
    }

    /// Script a failure for a recipient's next send.
    pub fn fail_next(&self, to: &str, error: &str) {
        self.add_outcome(
            to,
            Err(crate::error::BloodlineError::Other(anyhow::anyhow!(
                "{}",
                error.to_string()
            ))),
        );
    }

    /// Script an outcome that blocks until the returned sender is triggered
    /// (or dropped). Lets tests hold a send open across other operations.
    pub fn add_outcome_with_trigger(
        &self,
        to: &str,
        outcome: Result<SendReceipt>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.outcomes
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(MockOutcome::Triggered {
                outcome,
                trigger: Arc::new(Mutex::new(Some(rx))),
            });
        tx
    }

    /// All sends made through this mock.
    pub fn get_calls(&self) -> Vec<MockSend> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Distinct recipients contacted so far, in first-contact order.
    pub fn recipients(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for call in self.calls.lock().iter() {
            if !seen.contains(&call.to) {
                seen.push(call.to.clone());
            }
        }
        seen
    }

    /// Number of sends currently executing (useful for cancellation tests).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, to: &str, body: &str) -> Result<SendReceipt> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockSend {
            to: to.to_string(),
            body: body.to_string(),
        });

        let scripted = {
            let mut outcomes = self.outcomes.lock();
            match outcomes.get_mut(to) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match scripted {
            Some(MockOutcome::Immediate(outcome)) => outcome,
            Some(MockOutcome::Triggered { outcome, trigger }) => {
                let rx = trigger.lock().take();
                if let Some(rx) = rx {
                    // Proceed whether triggered or dropped
                    let _ = rx.await;
                }
                outcome
            }
            None => Ok(SendReceipt {
                message_id: uuid::Uuid::new_v4().to_string(),
            }),
        }
    }
}
