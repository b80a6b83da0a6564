//! Pairing session registry.
//!
//! Owns the attempt map: admits or rejects new attempts (dedup on attempt
//! id), spawns one driver task per admitted attempt, enforces the hard
//! deadline, and reaps finished attempts. Admission failures are the only
//! caller-visible errors; everything after admission resolves through
//! eviction and the notification sink.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::PairingTimings;
use crate::control::ControlPlane;
use crate::error::PairingError;
use crate::notify::NotificationSink;
use crate::pairing::machine::{MachineContext, MachineOutcome, PairingMachine};
use crate::pairing::{PairingAttempt, PairingMode, PairingStatus};
use crate::store::CredentialStore;
use crate::transport::Transport;

pub struct PairingRegistry {
    ctx: Arc<MachineContext>,
    transport: Arc<dyn Transport>,
    timings: PairingTimings,
    drivers: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl PairingRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        control: Arc<dyn ControlPlane>,
        sink: Arc<dyn NotificationSink>,
        timings: PairingTimings,
        session_prefix: impl Into<String>,
    ) -> Self {
        let ctx = Arc::new(MachineContext {
            attempts: Arc::new(RwLock::new(HashMap::new())),
            store,
            control,
            sink,
            settle_delay: timings.settle_delay,
            session_prefix: session_prefix.into(),
        });
        Self {
            ctx,
            transport,
            timings,
            drivers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit a pairing attempt and start driving it.
    ///
    /// Fails synchronously on a duplicate attempt id or empty field; all
    /// later failures surface only through eviction and the sink. A caller
    /// retrying after eviction must supply a new attempt id.
    pub async fn start_pairing(
        &self,
        phone_number: &str,
        attempt_id: &str,
        mode: PairingMode,
    ) -> Result<(), PairingError> {
        let phone_number = phone_number.trim();
        let attempt_id = attempt_id.trim();
        if phone_number.is_empty() {
            return Err(PairingError::MissingField {
                field: "phone_number".to_string(),
            });
        }
        if attempt_id.is_empty() {
            return Err(PairingError::MissingField {
                field: "attempt_id".to_string(),
            });
        }

        {
            let mut attempts = self.ctx.attempts.write().await;
            if attempts.contains_key(attempt_id) {
                return Err(PairingError::DuplicateAttempt {
                    attempt_id: attempt_id.to_string(),
                });
            }
            attempts.insert(
                attempt_id.to_string(),
                PairingAttempt {
                    attempt_id: attempt_id.to_string(),
                    phone_number: phone_number.to_string(),
                    requested_mode: mode,
                    status: PairingStatus::Starting,
                    session_id: None,
                    created_at: Utc::now(),
                },
            );
        }
        tracing::info!(attempt_id = %attempt_id, phone_number = %phone_number, "Pairing attempt admitted");

        // Hold the drivers lock across spawn + insert so the driver's own
        // cleanup cannot run before its handle is registered.
        let mut drivers = self.drivers.write().await;
        let handle = tokio::spawn(Self::drive(
            Arc::clone(&self.ctx),
            Arc::clone(&self.transport),
            self.timings.clone(),
            Arc::clone(&self.drivers),
            attempt_id.to_string(),
            phone_number.to_string(),
            mode,
        ));
        drivers.insert(attempt_id.to_string(), handle);
        Ok(())
    }

    /// Drive one attempt to a terminal state, then clean up after it.
    async fn drive(
        ctx: Arc<MachineContext>,
        transport: Arc<dyn Transport>,
        timings: PairingTimings,
        drivers: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
        attempt_id: String,
        phone_number: String,
        mode: PairingMode,
    ) {
        let run = async {
            let session = transport.connect().await.map_err(PairingError::from)?;
            PairingMachine::new(
                Arc::clone(&ctx),
                attempt_id.clone(),
                phone_number.clone(),
                mode,
            )
            .run(session)
            .await
        };

        match tokio::time::timeout(timings.deadline, run).await {
            Ok(Ok(MachineOutcome::Linked { session_id })) => {
                tracing::info!(
                    attempt_id = %attempt_id,
                    session_id = %session_id,
                    "Pairing complete; reaping after grace period"
                );
                // Grace delay so late event delivery is not truncated.
                tokio::time::sleep(timings.reap_grace).await;
                let mut attempts = ctx.attempts.write().await;
                if let Some(attempt) = attempts.get_mut(&attempt_id) {
                    attempt.status = PairingStatus::Reaped;
                }
                attempts.remove(&attempt_id);
            }
            Ok(Ok(MachineOutcome::Closed { reason })) => {
                tracing::info!(attempt_id = %attempt_id, reason = %reason, "Transport closed; evicting attempt");
                ctx.attempts.write().await.remove(&attempt_id);
            }
            Ok(Err(e)) => {
                tracing::warn!(attempt_id = %attempt_id, error = %e, "Pairing attempt failed; evicting");
                ctx.attempts.write().await.remove(&attempt_id);
            }
            Err(_) => {
                // Dropping the timed-out future tears down the session.
                tracing::warn!(
                    attempt_id = %attempt_id,
                    deadline_secs = timings.deadline.as_secs(),
                    "Pairing deadline elapsed; evicting attempt"
                );
                ctx.attempts.write().await.remove(&attempt_id);
            }
        }

        drivers.write().await.remove(&attempt_id);
    }

    /// Current state of one attempt, if it is still registered.
    pub async fn status(&self, attempt_id: &str) -> Option<PairingAttempt> {
        self.ctx.attempts.read().await.get(attempt_id).cloned()
    }

    /// Explicitly cancel an attempt: evict it and tear down its session.
    pub async fn cancel(&self, attempt_id: &str) -> Result<(), PairingError> {
        if self
            .ctx
            .attempts
            .write()
            .await
            .remove(attempt_id)
            .is_none()
        {
            return Err(PairingError::NotFound {
                attempt_id: attempt_id.to_string(),
            });
        }
        if let Some(handle) = self.drivers.write().await.remove(attempt_id) {
            handle.abort();
        }
        tracing::info!(attempt_id = %attempt_id, "Pairing attempt cancelled");
        Ok(())
    }

    /// Number of attempts currently registered.
    pub async fn active_count(&self) -> usize {
        self.ctx.attempts.read().await.len()
    }

    /// Abort every driver and flush the coalescing window best-effort.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.drivers.write().await.drain().collect();
        for (_, handle) in handles {
            handle.abort();
        }
        self.ctx.attempts.write().await.clear();
        match self.ctx.store.flush().await {
            Ok(true) => tracing::info!("Flushed credential record during shutdown"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Final credential flush failed during shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::control::RecordingControlPlane;
    use crate::notify::RecordingSink;
    use crate::store::MemoryKvStore;
    use crate::transport::{ScriptedTransport, TransportEvent};

    struct Harness {
        registry: PairingRegistry,
        transport: ScriptedTransport,
        control: Arc<RecordingControlPlane>,
        sink: Arc<RecordingSink>,
    }

    async fn harness(timings: PairingTimings) -> Harness {
        let transport = ScriptedTransport::new();
        let control = Arc::new(RecordingControlPlane::new());
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(
            CredentialStore::load(Arc::new(MemoryKvStore::new()), Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let registry = PairingRegistry::new(
            Arc::new(transport.clone()),
            store,
            Arc::clone(&control) as Arc<dyn ControlPlane>,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            timings,
            "pair",
        );
        Harness {
            registry,
            transport,
            control,
            sink,
        }
    }

    fn fast_timings() -> PairingTimings {
        PairingTimings {
            settle_delay: Duration::from_millis(5),
            deadline: Duration::from_millis(500),
            reap_grace: Duration::from_millis(30),
        }
    }

    /// Poll until `check` passes or a second elapses.
    async fn wait_until<F: AsyncFn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check().await
    }

    #[tokio::test]
    async fn test_duplicate_attempt_id_rejected() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("2348001234567", "p1", PairingMode::Prod)
            .await
            .unwrap();

        let err = h
            .registry
            .start_pairing("2348009999999", "p1", PairingMode::Prod)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::DuplicateAttempt { .. }));
        // The duplicate did not create a second attempt.
        assert_eq!(h.registry.active_count().await, 1);
        assert_eq!(
            h.registry.status("p1").await.unwrap().phone_number,
            "2348001234567"
        );
    }

    #[tokio::test]
    async fn test_missing_fields_rejected_without_state() {
        let h = harness(fast_timings()).await;

        let err = h
            .registry
            .start_pairing("", "p1", PairingMode::Prod)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::MissingField { field } if field == "phone_number"));

        let err = h
            .registry
            .start_pairing("234", "  ", PairingMode::Prod)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::MissingField { field } if field == "attempt_id"));

        assert_eq!(h.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_successful_pairing_journey() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("2348001234567", "p1", PairingMode::Prod)
            .await
            .unwrap();

        // The machine settles, then requests exactly one linking code.
        assert!(wait_until(async || h.transport.code_requests() == 1).await);
        let code_notices = h.sink.for_attempt("p1").await;
        assert_eq!(code_notices.len(), 1);
        assert_eq!(code_notices[0].code, "ABCD-1234");
        assert_eq!(
            h.registry.status("p1").await.unwrap().status,
            PairingStatus::CodeRequested
        );

        h.transport.emit(TransportEvent::Opened {
            owner_identity: "2348001234567@s".to_string(),
        });

        // Exactly one finalize call with a well-formed session id.
        assert!(wait_until(async || h.control.finalized().await.len() == 1).await);
        let finalized = h.control.finalized().await;
        let session_id = &finalized[0].session_id;
        let shape = regex::Regex::new(r"^pair_[a-z0-9]{12}$").unwrap();
        assert!(shape.is_match(session_id), "bad session id: {session_id}");

        // The session id went to the same sink as the linking code.
        let notices = h.sink.for_attempt("p1").await;
        assert_eq!(notices.len(), 2);
        assert_eq!(&notices[1].code, session_id);

        // Reaped after the grace delay, never a second code request.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.registry.status("p1").await.is_none());
        assert_eq!(h.transport.code_requests(), 1);
        assert_eq!(h.transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_before_open_evicts_without_finalize() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("2348001234567", "p2", PairingMode::Prod)
            .await
            .unwrap();

        assert!(wait_until(async || h.transport.code_requests() == 1).await);
        h.transport.emit(TransportEvent::Closed {
            reason: "stream errored".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.status("p2").await.is_none());
        assert!(h.control.finalized().await.is_empty());
        assert_eq!(h.transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_evicts_attempt() {
        let h = harness(fast_timings()).await;
        h.transport.fail_connect(true);
        h.registry
            .start_pairing("234", "p3", PairingMode::Dev)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.status("p3").await.is_none());
        assert!(h.control.finalized().await.is_empty());
    }

    #[tokio::test]
    async fn test_code_issuance_failure_evicts_attempt() {
        let h = harness(fast_timings()).await;
        h.transport.fail_code_issuance(true);
        h.registry
            .start_pairing("234", "p4", PairingMode::Prod)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.registry.status("p4").await.is_none());
        assert_eq!(h.transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_deadline_evicts_attempt_with_zero_events() {
        let timings = PairingTimings {
            settle_delay: Duration::from_millis(1),
            deadline: Duration::from_millis(60),
            reap_grace: Duration::from_millis(10),
        };
        let h = harness(timings).await;
        h.registry
            .start_pairing("234", "p5", PairingMode::Prod)
            .await
            .unwrap();
        assert!(h.registry.status("p5").await.is_some());

        // No events ever arrive; the deadline alone must clean up.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.registry.status("p5").await.is_none());
        assert_eq!(h.transport.open_sessions(), 0);
        assert!(h.control.finalized().await.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_run_independently() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("111", "a", PairingMode::Prod)
            .await
            .unwrap();
        h.registry
            .start_pairing("222", "b", PairingMode::Prod)
            .await
            .unwrap();
        assert_eq!(h.registry.active_count().await, 2);

        // Both sessions request codes; ending all streams evicts both.
        assert!(wait_until(async || h.transport.code_requests() == 2).await);
        h.transport.end_streams();
        assert!(wait_until(async || h.registry.active_count().await == 0).await);
    }

    #[tokio::test]
    async fn test_cancel_evicts_and_releases_session() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("234", "p6", PairingMode::Prod)
            .await
            .unwrap();
        assert!(wait_until(async || h.transport.open_sessions() == 1).await);

        h.registry.cancel("p6").await.unwrap();
        assert!(h.registry.status("p6").await.is_none());
        assert!(wait_until(async || h.transport.open_sessions() == 0).await);

        let err = h.registry.cancel("p6").await.unwrap_err();
        assert!(matches!(err, PairingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_attempt_id_can_be_reused_after_eviction() {
        let h = harness(fast_timings()).await;
        h.registry
            .start_pairing("234", "p7", PairingMode::Prod)
            .await
            .unwrap();
        h.registry.cancel("p7").await.unwrap();

        // A fresh attempt under the same id is a new admission.
        h.registry
            .start_pairing("234", "p7", PairingMode::Prod)
            .await
            .unwrap();
        assert_eq!(
            h.registry.status("p7").await.unwrap().status,
            PairingStatus::Starting
        );
    }
}
