//! Inbound HTTP surface.
//!
//! Two authenticated routes cover the whole inbound contract: start a
//! pairing attempt and forward a control-plane reload. Status and cancel
//! probes ride alongside for operators, and an unauthenticated health
//! probe for liveness checks. Every authenticated request is validated
//! with a constant-time shared-secret comparison before any state is
//! touched.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::control::ControlPlane;
use crate::error::{PairingError, ServerError};
use crate::pairing::{PairingMode, PairingRegistry};

/// Shared state for the route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PairingRegistry>,
    pub control: Arc<dyn ControlPlane>,
}

/// Shared-secret state injected into the auth middleware.
#[derive(Clone)]
pub struct AuthState {
    pub secret: SecretString,
}

/// Bearer auth middleware; constant-time comparison against the shared
/// secret. Rejected requests never reach a handler.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(header) = headers.get("authorization")
        && let Ok(value) = header.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && bool::from(
            token
                .as_bytes()
                .ct_eq(auth.secret.expose_secret().as_bytes()),
        )
    {
        return next.run(request).await;
    }

    (StatusCode::UNAUTHORIZED, "Invalid or missing auth token").into_response()
}

#[derive(Debug, Deserialize)]
pub struct StartPairingRequest {
    pub phone_number: String,
    pub attempt_id: String,
    pub mode: PairingMode,
}

async fn start_pairing(
    State(state): State<AppState>,
    Json(request): Json<StartPairingRequest>,
) -> Response {
    match state
        .registry
        .start_pairing(&request.phone_number, &request.attempt_id, request.mode)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "attempt_id": request.attempt_id })),
        )
            .into_response(),
        Err(PairingError::DuplicateAttempt { attempt_id }) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "duplicate attempt_id", "attempt_id": attempt_id })),
        )
            .into_response(),
        Err(PairingError::MissingField { field }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": format!("missing field: {field}") })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Unexpected admission failure");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn attempt_status(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Response {
    match state.registry.status(&attempt_id).await {
        Some(attempt) => Json(attempt).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Response {
    match state.registry.cancel(&attempt_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn control_reload(State(state): State<AppState>) -> Response {
    match state.control.reload().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Control plane reload forwarding failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Build the full router: authenticated API plus the open health probe.
pub fn router(state: AppState, secret: SecretString) -> Router {
    let auth = AuthState { secret };
    let api = Router::new()
        .route("/pairing", post(start_pairing))
        .route(
            "/pairing/{attempt_id}",
            get(attempt_status).delete(cancel_attempt),
        )
        .route("/control/reload", post(control_reload))
        .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
}

/// HTTP server lifecycle: bind, serve, graceful shutdown.
pub struct PairingServer {
    addr: SocketAddr,
    router: Option<Router>,
    bound_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PairingServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router: Some(router),
            bound_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let router = self.router.take().unwrap_or_default();
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: self.addr.to_string(),
                reason: e.to_string(),
            })?;

        let bound = listener.local_addr().map_err(|e| ServerError::BindFailed {
            addr: self.addr.to_string(),
            reason: e.to_string(),
        })?;
        self.bound_addr = Some(bound);
        tracing::info!(addr = %bound, "Pairing server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Pairing server shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "Pairing server error");
            }
        });
        self.handle = Some(handle);
        Ok(())
    }

    /// Address actually bound, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
