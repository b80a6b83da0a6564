//! In-memory transport with scriptable behavior.
//!
//! Tests (and local development) drive pairing flows by emitting events
//! into live sessions and asserting on recorded activity: connect counts,
//! linking-code requests, open-session counts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent, TransportSession};

#[derive(Default)]
struct ScriptState {
    identified: AtomicBool,
    fail_connect: AtomicBool,
    fail_code_issuance: AtomicBool,
    connects: AtomicUsize,
    code_requests: AtomicUsize,
    open_sessions: AtomicUsize,
    senders: std::sync::Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

/// Scriptable [`Transport`] whose sessions replay whatever the test emits.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future sessions report an already-registered identity.
    pub fn set_identified(&self, identified: bool) {
        self.state.identified.store(identified, Ordering::SeqCst);
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make linking-code issuance fail.
    pub fn fail_code_issuance(&self, fail: bool) {
        self.state.fail_code_issuance.store(fail, Ordering::SeqCst);
    }

    /// Emit an event into every live session.
    pub fn emit(&self, event: TransportEvent) {
        let mut senders = self.state.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End every live session's event stream.
    pub fn end_streams(&self) {
        self.state.senders.lock().unwrap().clear();
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn code_requests(&self) -> usize {
        self.state.code_requests.load(Ordering::SeqCst)
    }

    /// Sessions currently alive (not yet closed or dropped).
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                reason: "scripted connect failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.senders.lock().unwrap().push(tx);
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            events: rx,
            identified: self.state.identified.load(Ordering::SeqCst),
            released: false,
        }))
    }
}

struct ScriptedSession {
    state: Arc<ScriptState>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    identified: bool,
    released: bool,
}

impl ScriptedSession {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    fn is_identified(&self) -> bool {
        self.identified
    }

    async fn request_linking_code(
        &mut self,
        _phone_number: &str,
    ) -> Result<String, TransportError> {
        self.state.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_code_issuance.load(Ordering::SeqCst) {
            return Err(TransportError::CodeIssuance {
                reason: "scripted issuance failure".to_string(),
            });
        }
        Ok("ABCD-1234".to_string())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.events.close();
        self.release();
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}
