//! Per-attempt pairing state machine.
//!
//! One machine drives one attempt: it holds the attempt-local credential
//! record (disposable until finalization publishes it), requests the
//! linking code exactly once, and turns transport events into phase
//! transitions. Event handling is a plain transition function over the
//! closed event set, so tests can feed events directly.

use std::sync::Arc;
use std::time::Duration;

use crate::control::{ControlPlane, FinalizeRequest};
use crate::error::PairingError;
use crate::notify::{NotificationSink, PairingNotice};
use crate::pairing::{AttemptMap, PairingMode, PairingStatus, generate_session_id};
use crate::store::{CredentialRecord, CredentialStore};
use crate::transport::{TransportEvent, TransportSession};

/// Dependencies shared by every machine the registry spawns.
pub struct MachineContext {
    pub(crate) attempts: AttemptMap,
    pub(crate) store: Arc<CredentialStore>,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) settle_delay: Duration,
    pub(crate) session_prefix: String,
}

/// What one event did to the attempt.
#[derive(Debug)]
pub enum MachineStep {
    /// Nothing terminal; keep consuming events.
    Continue,
    /// Fully linked, persisted, and finalized.
    Linked { session_id: String },
    /// The transport ended the session.
    Closed { reason: String },
}

/// Terminal outcome of a machine run.
#[derive(Debug)]
pub enum MachineOutcome {
    Linked { session_id: String },
    Closed { reason: String },
}

pub struct PairingMachine {
    ctx: Arc<MachineContext>,
    attempt_id: String,
    phone_number: String,
    mode: PairingMode,
    /// Attempt-local credential state; thrown away unless the attempt
    /// finalizes.
    creds: CredentialRecord,
    code_requested: bool,
}

impl PairingMachine {
    pub fn new(
        ctx: Arc<MachineContext>,
        attempt_id: impl Into<String>,
        phone_number: impl Into<String>,
        mode: PairingMode,
    ) -> Self {
        Self {
            ctx,
            attempt_id: attempt_id.into(),
            phone_number: phone_number.into(),
            mode,
            creds: CredentialRecord::fresh(),
            code_requested: false,
        }
    }

    /// Drive the attempt over one transport session until a terminal step.
    ///
    /// Errors bubble to the registry driver, which evicts the attempt; the
    /// session is released on drop either way.
    pub async fn run(
        mut self,
        mut session: Box<dyn TransportSession>,
    ) -> Result<MachineOutcome, PairingError> {
        if !session.is_identified() {
            tokio::time::sleep(self.ctx.settle_delay).await;
            self.request_code(session.as_mut()).await?;
        }

        while let Some(event) = session.next_event().await {
            match self.handle_event(event).await? {
                MachineStep::Continue => {}
                MachineStep::Linked { session_id } => {
                    session.close().await;
                    return Ok(MachineOutcome::Linked { session_id });
                }
                MachineStep::Closed { reason } => {
                    session.close().await;
                    return Ok(MachineOutcome::Closed { reason });
                }
            }
        }

        Ok(MachineOutcome::Closed {
            reason: "event stream ended".to_string(),
        })
    }

    /// Request the one-time linking code and push it to the sink.
    ///
    /// Guarded so an attempt can never request a second code.
    async fn request_code(
        &mut self,
        session: &mut dyn TransportSession,
    ) -> Result<(), PairingError> {
        if self.code_requested {
            return Ok(());
        }
        let code = session.request_linking_code(&self.phone_number).await?;
        self.code_requested = true;
        self.set_status(PairingStatus::CodeRequested, None).await;
        tracing::info!(attempt_id = %self.attempt_id, "Linking code issued");

        self.ctx
            .sink
            .push(&PairingNotice {
                attempt_id: self.attempt_id.clone(),
                code,
                phone_number: self.phone_number.clone(),
            })
            .await;
        Ok(())
    }

    /// State-transition function over the closed transport event set.
    pub async fn handle_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<MachineStep, PairingError> {
        match event {
            TransportEvent::CredentialsUpdated(record) => {
                self.creds = record;
                Ok(MachineStep::Continue)
            }
            TransportEvent::Closed { reason } => Ok(MachineStep::Closed { reason }),
            TransportEvent::Opened { owner_identity } => {
                let session_id = generate_session_id(&self.ctx.session_prefix);

                // Publish the attempt-local snapshot into durable storage.
                // This is the one place attempt state becomes durable, and
                // a failed write here fails the attempt.
                self.ctx.store.replace(self.creds.clone()).await;
                self.ctx.store.flush().await?;

                self.ctx
                    .control
                    .finalize(&FinalizeRequest {
                        session_id: session_id.clone(),
                        phone_number: self.phone_number.clone(),
                        owner_identity,
                        mode: self.mode,
                    })
                    .await?;

                self.set_status(PairingStatus::Connected, Some(session_id.clone()))
                    .await;
                tracing::info!(
                    attempt_id = %self.attempt_id,
                    session_id = %session_id,
                    "Pairing attempt linked"
                );

                self.ctx
                    .sink
                    .push(&PairingNotice {
                        attempt_id: self.attempt_id.clone(),
                        code: session_id.clone(),
                        phone_number: self.phone_number.clone(),
                    })
                    .await;

                Ok(MachineStep::Linked { session_id })
            }
        }
    }

    async fn set_status(&self, status: PairingStatus, session_id: Option<String>) {
        if let Some(attempt) = self.ctx.attempts.write().await.get_mut(&self.attempt_id) {
            attempt.status = status;
            if session_id.is_some() {
                attempt.session_id = session_id;
            }
        }
    }
}
