//! Best-effort outbound notifications.
//!
//! Linking codes and derived session ids travel to an external sink keyed
//! by attempt id. The contract is explicitly best-effort: no delivery
//! guarantee, no retry, no acknowledgement awaited. Callers observe pairing
//! outcomes through this sink rather than through return values.

use async_trait::async_trait;
use serde::Serialize;

/// One notification: either a linking code or, after a successful link,
/// the derived session id in the `code` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingNotice {
    pub attempt_id: String,
    pub code: String,
    pub phone_number: String,
}

/// Fire-and-forget notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Push a notice. Delivery failures are the implementation's problem
    /// to log; they never surface to the pairing flow.
    async fn push(&self, notice: &PairingNotice);
}

/// Sink that POSTs notices to an external endpoint.
pub struct HttpNotificationSink {
    http: reqwest::Client,
    url: String,
}

impl HttpNotificationSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn push(&self, notice: &PairingNotice) {
        match self.http.post(&self.url).json(notice).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    attempt_id = %notice.attempt_id,
                    status = %response.status(),
                    "Notification sink rejected notice"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    attempt_id = %notice.attempt_id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    }
}

/// Sink that records notices in memory, for tests.
#[derive(Default)]
pub struct RecordingSink {
    notices: tokio::sync::Mutex<Vec<PairingNotice>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notices(&self) -> Vec<PairingNotice> {
        self.notices.lock().await.clone()
    }

    /// Notices recorded for one attempt, in delivery order.
    pub async fn for_attempt(&self, attempt_id: &str) -> Vec<PairingNotice> {
        self.notices
            .lock()
            .await
            .iter()
            .filter(|n| n.attempt_id == attempt_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn push(&self, notice: &PairingNotice) {
        self.notices.lock().await.push(notice.clone());
    }
}
