//! Pairing: linking a phone number to a durable automated session.
//!
//! A pairing attempt is one end-to-end effort to link a phone number. The
//! [`registry::PairingRegistry`] admits and dedups attempts and owns their
//! lifecycle; [`machine::PairingMachine`] drives a single attempt through
//! its phases against the transport. Phases are strictly ordered:
//!
//! ```text
//! starting --> code_requested --> connected --> reaped
//!     \              \                |
//!      \              \               v
//!       +--------------+-------> evicted (error / close / deadline)
//! ```

pub mod machine;
pub mod registry;

pub use machine::{MachineOutcome, MachineStep, PairingMachine};
pub use registry::PairingRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Which environment the linked session is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    Prod,
    Dev,
}

/// Phase of one pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Starting,
    CodeRequested,
    Connected,
    Reaped,
}

/// One in-flight pairing attempt. Owned exclusively by the registry and
/// mutated only by the machine driving it.
#[derive(Debug, Clone, Serialize)]
pub struct PairingAttempt {
    pub attempt_id: String,
    pub phone_number: String,
    pub requested_mode: PairingMode,
    pub status: PairingStatus,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry map shared between the registry and attempt drivers.
pub(crate) type AttemptMap = Arc<RwLock<HashMap<String, PairingAttempt>>>;

/// Charset for session-id suffixes: lowercase alphanumeric only, so the id
/// survives case-insensitive carriers unchanged.
const SESSION_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_ID_SUFFIX_LEN: usize = 12;

/// Derive a globally unique session identifier: `<prefix>_[a-z0-9]{12}`.
pub fn generate_session_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| SESSION_ID_CHARSET[rng.gen_range(0..SESSION_ID_CHARSET.len())] as char)
        .collect();
    format!("{prefix}_{suffix}")
}
