//! Control-plane client.
//!
//! The control plane is the external service tracking durable sessions,
//! settings, and plan state. This crate consumes two calls: `finalize`
//! registers a freshly linked session (and must succeed before the attempt
//! counts as complete), and `reload` forwards an opaque refresh signal.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::ControlPlaneError;
use crate::pairing::PairingMode;

/// Payload registering a durable session with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeRequest {
    pub session_id: String,
    pub phone_number: String,
    pub owner_identity: String,
    pub mode: PairingMode,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register a completed attempt's durable identity. Must succeed before
    /// the attempt is considered complete.
    async fn finalize(&self, request: &FinalizeRequest) -> Result<(), ControlPlaneError>;

    /// Forward an opaque reload/refresh signal.
    async fn reload(&self) -> Result<(), ControlPlaneError>;
}

/// HTTP client for the control plane, authenticated with the shared secret.
pub struct HttpControlPlane {
    http: reqwest::Client,
    base_url: String,
    secret: SecretString,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, secret: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.secret.expose_secret())
    }

    async fn expect_success(
        response: reqwest::Response,
    ) -> Result<(), ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControlPlaneError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<(), ControlPlaneError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .header("authorization", self.bearer())
            .json(request)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    async fn reload(&self) -> Result<(), ControlPlaneError> {
        let response = self
            .http
            .post(format!("{}/reload", self.base_url))
            .header("authorization", self.bearer())
            .send()
            .await?;
        Self::expect_success(response).await
    }
}

/// Control plane that records calls in memory, for tests.
#[derive(Default)]
pub struct RecordingControlPlane {
    finalized: tokio::sync::Mutex<Vec<FinalizeRequest>>,
    reloads: std::sync::atomic::AtomicUsize,
    reject_finalize: std::sync::atomic::AtomicBool,
    reject_reload: std::sync::atomic::AtomicBool,
}

impl RecordingControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent finalize calls fail.
    pub fn reject_finalize(&self, reject: bool) {
        self.reject_finalize
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    /// Make subsequent reload calls fail.
    pub fn reject_reload(&self, reject: bool) {
        self.reject_reload
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn finalized(&self) -> Vec<FinalizeRequest> {
        self.finalized.lock().await.clone()
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<(), ControlPlaneError> {
        if self
            .reject_finalize
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(ControlPlaneError::Rejected {
                status: 503,
                body: "finalize rejected".to_string(),
            });
        }
        self.finalized.lock().await.push(request.clone());
        Ok(())
    }

    async fn reload(&self) -> Result<(), ControlPlaneError> {
        if self.reject_reload.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ControlPlaneError::Rejected {
                status: 503,
                body: "reload rejected".to_string(),
            });
        }
        self.reloads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_control_plane_captures_finalize() {
        let control = RecordingControlPlane::new();
        let request = FinalizeRequest {
            session_id: "pair_abc123def456".to_string(),
            phone_number: "2348001234567".to_string(),
            owner_identity: "2348001234567@s".to_string(),
            mode: PairingMode::Prod,
        };
        control.finalize(&request).await.unwrap();

        let calls = control.finalized().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], request);
    }

    #[tokio::test]
    async fn test_recording_control_plane_rejects_when_told() {
        let control = RecordingControlPlane::new();
        control.reject_finalize(true);
        let request = FinalizeRequest {
            session_id: "s".to_string(),
            phone_number: "p".to_string(),
            owner_identity: "o".to_string(),
            mode: PairingMode::Dev,
        };
        assert!(control.finalize(&request).await.is_err());
        assert!(control.finalized().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_counting() {
        let control = RecordingControlPlane::new();
        control.reload().await.unwrap();
        control.reload().await.unwrap();
        assert_eq!(control.reload_count(), 2);
    }

    #[test]
    fn test_finalize_request_serializes_mode_lowercase() {
        let request = FinalizeRequest {
            session_id: "pair_x".to_string(),
            phone_number: "234".to_string(),
            owner_identity: "234@s".to_string(),
            mode: PairingMode::Prod,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["mode"], "prod");
    }
}
