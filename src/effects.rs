//! Side effects that leave the engine: physical access, invoices, messages.
//!
//! Transitions never call a collaborator while holding a lock. They commit,
//! then hand [`Intent`]s to [`Effects`], which a background task delivers in
//! order. Failures are advisory: logged and counted, never surfaced to the
//! caller of the transition.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{Money, TimeSlot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvisoryError {
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: rust_decimal::Decimal,
    pub rate: Money,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Template {
    ReservationConfirmed,
    ReservationCancelled,
    ReservationNoShow,
    EntitlementExpiring,
    EntitlementExpired,
    EntitlementRenewed,
}

#[async_trait]
pub trait AccessGateway: Send + Sync {
    async fn grant(&self, user: Ulid, resource: Ulid, slot: TimeSlot) -> Result<(), AdvisoryError>;
    async fn revoke(&self, user: Ulid, resource: Ulid) -> Result<(), AdvisoryError>;
}

#[async_trait]
pub trait Invoicing: Send + Sync {
    /// Returns the invoice reference.
    async fn create_invoice(&self, payer: Ulid, lines: Vec<InvoiceLine>) -> Result<String, AdvisoryError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: Ulid,
        template: Template,
        data: serde_json::Value,
    ) -> Result<(), AdvisoryError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Grant {
        user: Ulid,
        resource: Ulid,
        slot: TimeSlot,
    },
    Revoke {
        user: Ulid,
        resource: Ulid,
    },
    Invoice {
        reservation: Ulid,
        payer: Ulid,
        lines: Vec<InvoiceLine>,
    },
    Notify {
        recipient: Ulid,
        template: Template,
        data: serde_json::Value,
    },
}

impl Intent {
    fn collaborator(&self) -> &'static str {
        match self {
            Intent::Grant { .. } | Intent::Revoke { .. } => "access_gateway",
            Intent::Invoice { .. } => "invoicing",
            Intent::Notify { .. } => "notifier",
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn AccessGateway>,
    pub invoicing: Arc<dyn Invoicing>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Collaborators that only log what they would have done.
    pub fn logging() -> Self {
        let sink = Arc::new(LogSink);
        Self {
            gateway: sink.clone(),
            invoicing: sink.clone(),
            notifier: sink,
        }
    }

    /// Route every collaborator call into one recorder.
    pub fn recording(recorder: Arc<Recorder>) -> Self {
        Self {
            gateway: recorder.clone(),
            invoicing: recorder.clone(),
            notifier: recorder,
        }
    }
}

/// Handle to the background delivery task.
#[derive(Clone)]
pub struct Effects {
    tx: mpsc::UnboundedSender<Intent>,
}

impl Effects {
    pub fn spawn(collaborators: Collaborators) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(delivery_loop(collaborators, rx));
        Self { tx }
    }

    pub fn dispatch(&self, intents: Vec<Intent>) {
        for intent in intents {
            if self.tx.send(intent).is_err() {
                warn!("effects worker shut down, dropping intent");
                break;
            }
        }
    }
}

/// Deliver intents one at a time so a revoke never overtakes its grant.
async fn delivery_loop(collaborators: Collaborators, mut rx: mpsc::UnboundedReceiver<Intent>) {
    while let Some(intent) = rx.recv().await {
        let label = intent.collaborator();
        if let Err(e) = deliver(&collaborators, intent).await {
            warn!(collaborator = label, "advisory failure: {e}");
            metrics::counter!(crate::observability::ADVISORY_FAILURES_TOTAL, "collaborator" => label)
                .increment(1);
        }
    }
}

async fn deliver(c: &Collaborators, intent: Intent) -> Result<(), AdvisoryError> {
    match intent {
        Intent::Grant { user, resource, slot } => c.gateway.grant(user, resource, slot).await,
        Intent::Revoke { user, resource } => c.gateway.revoke(user, resource).await,
        Intent::Invoice {
            reservation,
            payer,
            lines,
        } => {
            let invoice = c.invoicing.create_invoice(payer, lines).await?;
            info!(%reservation, %invoice, "invoice created");
            Ok(())
        }
        Intent::Notify {
            recipient,
            template,
            data,
        } => c.notifier.send(recipient, template, data).await,
    }
}

struct LogSink;

#[async_trait]
impl AccessGateway for LogSink {
    async fn grant(&self, user: Ulid, resource: Ulid, slot: TimeSlot) -> Result<(), AdvisoryError> {
        info!(%user, %resource, date = %slot.date, "access grant");
        Ok(())
    }

    async fn revoke(&self, user: Ulid, resource: Ulid) -> Result<(), AdvisoryError> {
        info!(%user, %resource, "access revoke");
        Ok(())
    }
}

#[async_trait]
impl Invoicing for LogSink {
    async fn create_invoice(&self, payer: Ulid, lines: Vec<InvoiceLine>) -> Result<String, AdvisoryError> {
        let reference = format!("INV-{}", Ulid::new());
        info!(%payer, lines = lines.len(), %reference, "invoice requested");
        Ok(reference)
    }
}

#[async_trait]
impl Notifier for LogSink {
    async fn send(
        &self,
        recipient: Ulid,
        template: Template,
        _data: serde_json::Value,
    ) -> Result<(), AdvisoryError> {
        debug!(%recipient, ?template, "notification");
        Ok(())
    }
}

/// Collaborator that keeps every intent it receives. Optionally fails every
/// call after recording it.
pub struct Recorder {
    seen: Mutex<Vec<Intent>>,
    changed: Notify,
    fail: bool,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            changed: Notify::new(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn intents(&self) -> Vec<Intent> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until at least `n` intents arrived, or the timeout passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Intent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let seen = self.intents();
            if seen.len() >= n {
                return seen;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.intents();
            }
        }
    }

    fn record(&self, intent: Intent) -> Result<(), AdvisoryError> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push(intent);
        self.changed.notify_waiters();
        if self.fail {
            return Err(AdvisoryError::Unreachable("recorder configured to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccessGateway for Recorder {
    async fn grant(&self, user: Ulid, resource: Ulid, slot: TimeSlot) -> Result<(), AdvisoryError> {
        self.record(Intent::Grant { user, resource, slot })
    }

    async fn revoke(&self, user: Ulid, resource: Ulid) -> Result<(), AdvisoryError> {
        self.record(Intent::Revoke { user, resource })
    }
}

#[async_trait]
impl Invoicing for Recorder {
    async fn create_invoice(&self, payer: Ulid, lines: Vec<InvoiceLine>) -> Result<String, AdvisoryError> {
        self.record(Intent::Invoice {
            reservation: Ulid::nil(),
            payer,
            lines,
        })?;
        Ok(format!("INV-{}", Ulid::new()))
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn send(
        &self,
        recipient: Ulid,
        template: Template,
        data: serde_json::Value,
    ) -> Result<(), AdvisoryError> {
        self.record(Intent::Notify {
            recipient,
            template,
            data,
        })
    }
}
