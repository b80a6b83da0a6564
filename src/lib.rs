//! pairlink: a control plane for linking phone numbers to long-running
//! messaging-automation sessions.
//!
//! The service accepts pairing requests over HTTP, drives each attempt
//! through a transport-backed linking state machine, persists the session
//! credentials to a remote key-value store with write coalescing, and
//! hands finished sessions off to the downstream control plane.
//!
//! Module map:
//! - [`pairing`] — attempt registry and linking state machine
//! - [`store`] — credential records and the coalescing KV-backed store
//! - [`transport`] — messaging-transport abstraction plus the HTTP gateway
//!   adapter and a scripted double for tests
//! - [`control`] — downstream control-plane client (finalize, reload)
//! - [`notify`] — best-effort operator notification sink
//! - [`server`] — authenticated inbound HTTP surface
//! - [`config`] — environment-driven configuration
//! - [`error`] — error taxonomy shared across the crate

pub mod config;
pub mod control;
pub mod error;
pub mod notify;
pub mod pairing;
pub mod server;
pub mod store;
pub mod transport;

pub use config::{Config, PairingTimings};
pub use control::{ControlPlane, FinalizeRequest, HttpControlPlane};
pub use error::{
    ConfigError, ControlPlaneError, Error, PairingError, Result, ServerError, StoreError,
    TransportError,
};
pub use notify::{HttpNotificationSink, NotificationSink, PairingNotice};
pub use pairing::{PairingAttempt, PairingMode, PairingRegistry, PairingStatus};
pub use server::{AppState, PairingServer, router};
pub use store::{Binary, CredentialRecord, CredentialStore, HttpKvStore, KvStore, MemoryKvStore};
pub use transport::{GatewayTransport, Transport, TransportEvent, TransportSession};
