//! Narrow interface to the external messaging transport.
//!
//! The transport itself (socket handling, wire encryption, protocol
//! framing) is an external capability. This crate only consumes the seam:
//! open a session, ask it for a one-time linking code, and react to its
//! event stream. The event set is closed — everything a pairing attempt can
//! observe is one of [`TransportEvent`]'s three variants — so state
//! transitions can be driven synchronously by test harnesses without a real
//! transport.

mod gateway;
pub mod scripted;

pub use gateway::GatewayTransport;
pub use scripted::ScriptedTransport;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::store::CredentialRecord;

/// Events a transport session can emit.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The device is fully linked; the attempt can finalize.
    Opened { owner_identity: String },
    /// The session ended. Terminal for the attempt; no resumption.
    Closed { reason: String },
    /// The transport rotated or extended the session's credential
    /// material; the payload is the updated record.
    CredentialsUpdated(CredentialRecord),
}

/// Factory for transport sessions, one per pairing attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One live transport session.
///
/// Sessions release their underlying resources on drop, so an attempt
/// abandoned mid-await (deadline eviction) still tears down cleanly.
#[async_trait]
pub trait TransportSession: Send {
    /// Whether the session already holds a registered identity. When false
    /// the peer must enter a linking code to authorize the link.
    fn is_identified(&self) -> bool;

    /// Request a one-time linking code for the given phone number.
    async fn request_linking_code(&mut self, phone_number: &str)
    -> Result<String, TransportError>;

    /// Next event from the session, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Tear the session down explicitly.
    async fn close(&mut self);
}
