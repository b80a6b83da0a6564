//! HTTP adapter for an external transport gateway.
//!
//! The gateway owns the actual socket, wire encryption, and framing; this
//! adapter maps its small REST surface onto the [`Transport`] seam:
//! `POST /sessions` opens a session, `POST /sessions/{id}/pairing-code`
//! issues a linking code, `GET /sessions/{id}/events` long-polls the event
//! stream (204 when the poll window passes quietly), and
//! `DELETE /sessions/{id}` tears the session down.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::TransportError;
use crate::store::CredentialRecord;
use crate::transport::{Transport, TransportEvent, TransportSession};

pub struct GatewayTransport {
    http: reqwest::Client,
    base_url: String,
    secret: SecretString,
}

#[derive(Deserialize)]
struct SessionOpened {
    session: String,
    identified: bool,
}

#[derive(Deserialize)]
struct CodeIssued {
    code: String,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GatewayEvent {
    Opened {
        owner_identity: String,
    },
    Closed {
        reason: Option<String>,
    },
    CredentialsUpdated {
        credentials: CredentialRecord,
    },
}

impl GatewayTransport {
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
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .header("authorization", self.bearer())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Connect {
                reason: format!("gateway returned status {}", response.status()),
            });
        }

        let opened: SessionOpened = response.json().await?;
        Ok(Box::new(GatewaySession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            bearer: self.bearer(),
            session: opened.session,
            identified: opened.identified,
            ended: false,
            released: false,
        }))
    }
}

struct GatewaySession {
    http: reqwest::Client,
    base_url: String,
    bearer: String,
    session: String,
    identified: bool,
    ended: bool,
    released: bool,
}

#[async_trait]
impl TransportSession for GatewaySession {
    fn is_identified(&self) -> bool {
        self.identified
    }

    async fn request_linking_code(
        &mut self,
        phone_number: &str,
    ) -> Result<String, TransportError> {
        let response = self
            .http
            .post(format!(
                "{}/sessions/{}/pairing-code",
                self.base_url, self.session
            ))
            .header("authorization", &self.bearer)
            .json(&serde_json::json!({ "phone_number": phone_number }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::CodeIssuance {
                reason: format!("gateway returned status {}", response.status()),
            });
        }

        let issued: CodeIssued = response.json().await?;
        Ok(issued.code)
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        while !self.ended {
            let response = self
                .http
                .get(format!("{}/sessions/{}/events", self.base_url, self.session))
                .header("authorization", &self.bearer)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(session = %self.session, error = %e, "Gateway event poll failed");
                    self.ended = true;
                    return None;
                }
            };

            // Quiet poll window; ask again.
            if response.status() == StatusCode::NO_CONTENT {
                continue;
            }
            if !response.status().is_success() {
                tracing::warn!(
                    session = %self.session,
                    status = %response.status(),
                    "Gateway event poll rejected"
                );
                self.ended = true;
                return None;
            }

            match response.json::<GatewayEvent>().await {
                Ok(GatewayEvent::Opened { owner_identity }) => {
                    return Some(TransportEvent::Opened { owner_identity });
                }
                Ok(GatewayEvent::Closed { reason }) => {
                    self.ended = true;
                    return Some(TransportEvent::Closed {
                        reason: reason.unwrap_or_else(|| "gateway closed session".to_string()),
                    });
                }
                Ok(GatewayEvent::CredentialsUpdated { credentials }) => {
                    return Some(TransportEvent::CredentialsUpdated(credentials));
                }
                Err(e) => {
                    tracing::warn!(session = %self.session, error = %e, "Undecodable gateway event");
                    self.ended = true;
                    return None;
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        self.ended = true;
        if self.released {
            return;
        }
        self.released = true;
        let result = self
            .http
            .delete(format!("{}/sessions/{}", self.base_url, self.session))
            .header("authorization", &self.bearer)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(session = %self.session, error = %e, "Gateway session delete failed");
        }
    }
}

/// Sessions abandoned mid-await (deadline eviction, cancel, error paths)
/// never reach `close()`, so the remote teardown also runs on drop.
impl Drop for GatewaySession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let http = self.http.clone();
        let url = format!("{}/sessions/{}", self.base_url, self.session);
        let bearer = self.bearer.clone();
        let session = self.session.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = http.delete(url).header("authorization", bearer).send().await {
                    tracing::debug!(session = %session, error = %e, "Gateway session delete failed");
                }
            });
        }
    }
}
