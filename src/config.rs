//! Environment-driven configuration.
//!
//! All settings come from environment variables (optionally loaded from a
//! `.env` file by the binary). The shared secret and KV token are held in
//! `SecretString` so they never appear in debug output or logs.

use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Timing knobs for the pairing lifecycle.
#[derive(Debug, Clone)]
pub struct PairingTimings {
    /// Delay between detecting an unidentified session and requesting the
    /// linking code, giving the transport time to settle.
    pub settle_delay: Duration,
    /// Hard deadline for one attempt; attempts older than this are evicted
    /// regardless of phase.
    pub deadline: Duration,
    /// Grace period between a successful link and registry cleanup, so late
    /// event delivery is not truncated.
    pub reap_grace: Duration,
}

impl Default for PairingTimings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            deadline: Duration::from_secs(120),
            reap_grace: Duration::from_secs(5),
        }
    }
}

/// Top-level service configuration.
#[derive(Clone)]
pub struct Config {
    /// Address the inbound HTTP surface binds to.
    pub bind_addr: SocketAddr,
    /// Shared secret required on every inbound request and attached to every
    /// outbound control-plane and KV call.
    pub shared_secret: SecretString,
    /// Base URL of the remote key-value service.
    pub kv_url: String,
    /// Bearer token for the key-value service.
    pub kv_token: SecretString,
    /// Base URL of the control plane (finalize, reload).
    pub control_plane_url: String,
    /// URL the linking-code / session-id notifications are pushed to.
    pub notify_url: String,
    /// Base URL of the external transport gateway.
    pub transport_url: String,
    /// Prefix for derived session identifiers.
    pub session_prefix: String,
    /// Pairing lifecycle timings.
    pub pairing: PairingTimings,
    /// Coalescing window for credential-record writes.
    pub coalesce_window: Duration,
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env_or("PAIRLINK_BIND_ADDR", "0.0.0.0:3000");
        let bind_addr: SocketAddr =
            bind_addr
                .parse()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "PAIRLINK_BIND_ADDR".to_string(),
                    message: format!("not a socket address: {e}"),
                })?;

        Ok(Self {
            bind_addr,
            shared_secret: required("PAIRLINK_SHARED_SECRET")?.into(),
            kv_url: required("PAIRLINK_KV_URL")?,
            kv_token: required("PAIRLINK_KV_TOKEN")?.into(),
            control_plane_url: required("PAIRLINK_CONTROL_URL")?,
            notify_url: required("PAIRLINK_NOTIFY_URL")?,
            transport_url: required("PAIRLINK_TRANSPORT_URL")?,
            session_prefix: env_or("PAIRLINK_SESSION_PREFIX", "pair"),
            pairing: PairingTimings {
                settle_delay: env_secs("PAIRLINK_SETTLE_DELAY_SECS", 3)?,
                deadline: env_secs("PAIRLINK_PAIRING_DEADLINE_SECS", 120)?,
                reap_grace: env_secs("PAIRLINK_REAP_GRACE_SECS", 5)?,
            },
            coalesce_window: env_secs("PAIRLINK_COALESCE_WINDOW_SECS", 60)?,
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected whole seconds, got {v:?}"),
            }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_timings_default() {
        let timings = PairingTimings::default();
        assert_eq!(timings.settle_delay, Duration::from_secs(3));
        assert_eq!(timings.deadline, Duration::from_secs(120));
        assert_eq!(timings.reap_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_env_secs_parses_valid_value() {
        // Env mutation is process-global, so use a key unique to this test.
        unsafe { std::env::set_var("PAIRLINK_TEST_SECS_VALID", "90") };
        let d = env_secs("PAIRLINK_TEST_SECS_VALID", 10).unwrap();
        assert_eq!(d, Duration::from_secs(90));
    }

    #[test]
    fn test_env_secs_falls_back_to_default() {
        let d = env_secs("PAIRLINK_TEST_SECS_UNSET", 42).unwrap();
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn test_env_secs_rejects_garbage() {
        unsafe { std::env::set_var("PAIRLINK_TEST_SECS_BAD", "soon") };
        let err = env_secs("PAIRLINK_TEST_SECS_BAD", 10).unwrap_err();
        assert!(err.to_string().contains("PAIRLINK_TEST_SECS_BAD"));
    }

    #[test]
    fn test_required_rejects_empty() {
        unsafe { std::env::set_var("PAIRLINK_TEST_EMPTY", "  ") };
        assert!(required("PAIRLINK_TEST_EMPTY").is_err());
    }
}
