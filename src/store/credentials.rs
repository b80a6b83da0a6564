//! Credential persistence: the coalesced `creds` record and the
//! independently durable `key-<category>-<id>` records.
//!
//! The credential record mutates on nearly every protocol exchange, so
//! writes are coalesced: a mutation marks the record dirty and arms a
//! deadline; further mutations inside the window reset the deadline instead
//! of scheduling more writes. Losing the latest snapshot only costs
//! replaying recent state. Key records are different: each one anchors a
//! specific cryptographic exchange, so every write and delete is durable
//! immediately and failures propagate to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::encoding::Binary;
use crate::store::kv::KvStore;

/// Logical key holding the encoded credential record.
pub const CREDS_KEY: &str = "creds";

/// A public/secret key pair of raw key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: Binary,
    pub secret: Binary,
}

impl KeyPair {
    /// Generate a fresh 32-byte pair from the OS RNG.
    fn generate() -> Self {
        Self {
            public: Binary(random_bytes(32)),
            secret: Binary(random_bytes(32)),
        }
    }
}

/// A signed pre-key: key pair plus the identity signature over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: Binary,
}

/// Identity of the linked device, known once the transport reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: Option<String>,
}

/// The composite, frequently-mutated identity/session state of one linked
/// device. Logically singular per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub device_id: String,
    pub noise_key: KeyPair,
    pub identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    pub registration_id: u32,
    pub adv_secret: Binary,
    pub me: Option<DeviceIdentity>,
    pub account_synced: bool,
    pub next_pre_key_id: u32,
}

impl CredentialRecord {
    /// Default-initialize a record with fresh key material, as happens on
    /// the first read when nothing is stored yet.
    pub fn fresh() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            noise_key: KeyPair::generate(),
            identity_key: KeyPair::generate(),
            signed_pre_key: SignedPreKey {
                id: 1,
                key_pair: KeyPair::generate(),
                signature: Binary(random_bytes(64)),
            },
            registration_id: OsRng.gen_range(1..=0x3fff),
            adv_secret: Binary(random_bytes(32)),
            me: None,
            account_synced: false,
            next_pre_key_id: 1,
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Explicit coalescing state for the credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceState {
    /// Whether the in-memory record has mutations not yet written.
    pub dirty: bool,
    /// When the pending coalesced write is due, if one is armed.
    pub pending_deadline: Option<Instant>,
}

impl CoalesceState {
    fn clean() -> Self {
        Self {
            dirty: false,
            pending_deadline: None,
        }
    }
}

/// Durable store for one device's credential bundle.
///
/// Holds one coalescing state, which assumes a single active session per
/// process. Concurrent multi-session use would need per-session coalescing
/// state.
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
    window: Duration,
    record: RwLock<CredentialRecord>,
    coalesce: Mutex<CoalesceState>,
    /// Key records observed by this process; the remote store has no
    /// listing, so `wipe` works from this set.
    known_keys: RwLock<HashSet<String>>,
}

impl CredentialStore {
    /// Read the credential record once and build the store around it.
    ///
    /// An absent or undecodable record default-initializes with fresh key
    /// material (re-pairing is safer than operating on corrupted material).
    /// A network failure propagates: it does not mean the record is absent.
    pub async fn load(kv: Arc<dyn KvStore>, window: Duration) -> Result<Self, StoreError> {
        let record = match kv.get(CREDS_KEY).await? {
            Some(text) => match serde_json::from_str(&text) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Stored credential record is undecodable; starting fresh");
                    CredentialRecord::fresh()
                }
            },
            None => CredentialRecord::fresh(),
        };

        Ok(Self {
            kv,
            window,
            record: RwLock::new(record),
            coalesce: Mutex::new(CoalesceState::clean()),
            known_keys: RwLock::new(HashSet::new()),
        })
    }

    /// Clone of the current in-memory record.
    pub async fn snapshot(&self) -> CredentialRecord {
        self.record.read().await.clone()
    }

    /// Current coalescing state.
    pub async fn coalesce_state(&self) -> CoalesceState {
        *self.coalesce.lock().await
    }

    /// Apply a mutation and arm (or re-arm) the coalescing window.
    ///
    /// A mutation arriving while a write is already pending resets the
    /// deadline rather than scheduling a second write.
    pub async fn mutate<F: FnOnce(&mut CredentialRecord)>(&self, f: F) {
        f(&mut *self.record.write().await);
        let mut state = self.coalesce.lock().await;
        state.dirty = true;
        state.pending_deadline = Some(Instant::now() + self.window);
    }

    /// Replace the whole record, e.g. when a finished pairing attempt
    /// publishes its credential snapshot.
    pub async fn replace(&self, record: CredentialRecord) {
        *self.record.write().await = record;
        let mut state = self.coalesce.lock().await;
        state.dirty = true;
        state.pending_deadline = Some(Instant::now() + self.window);
    }

    /// Fire the coalesced write if it is due at `now`.
    ///
    /// Returns whether a write happened. A failed write is logged and
    /// dropped: the in-memory record stays authoritative and the record
    /// stays dirty until a later flush or mutation succeeds.
    pub async fn tick(&self, now: Instant) -> bool {
        let mut state = self.coalesce.lock().await;
        if !state.dirty || state.pending_deadline.is_none_or(|due| due > now) {
            return false;
        }

        match self.write_record().await {
            Ok(()) => {
                *state = CoalesceState::clean();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Coalesced credential write failed; keeping in-memory state");
                state.pending_deadline = None;
                false
            }
        }
    }

    /// Write the record immediately if dirty, propagating failure.
    ///
    /// Used at finalization and shutdown, where the caller needs to know
    /// the write stuck.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let mut state = self.coalesce.lock().await;
        if !state.dirty {
            return Ok(false);
        }
        self.write_record().await?;
        *state = CoalesceState::clean();
        Ok(true)
    }

    async fn write_record(&self) -> Result<(), StoreError> {
        let text = serde_json::to_string(&*self.record.read().await)?;
        self.kv.set(CREDS_KEY, &text, None).await
    }

    /// Drive `tick` on an interval from a background task.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if store.tick(Instant::now()).await {
                    tracing::debug!("Flushed coalesced credential record");
                }
            }
        })
    }

    /// Remote key name for a `(category, id)` item.
    pub fn key_name(category: &str, id: &str) -> String {
        format!("key-{category}-{id}")
    }

    /// Fetch a batch of key records in parallel.
    ///
    /// Unknown ids are normal on first use: absence, a failed read, and an
    /// undecodable value all degrade to `None` (the latter two logged).
    pub async fn read_keys(&self, category: &str, ids: &[&str]) -> HashMap<String, Option<Value>> {
        let reads = ids.iter().map(|id| {
            let key = Self::key_name(category, id);
            async move {
                let value = match self.kv.get(&key).await {
                    Ok(Some(text)) => match serde_json::from_str(&text) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Undecodable key record; treating as absent");
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Key record read failed; treating as absent");
                        None
                    }
                };
                (id.to_string(), key, value)
            }
        });

        let mut out = HashMap::with_capacity(ids.len());
        let mut known = self.known_keys.write().await;
        for (id, key, value) in join_all(reads).await {
            if value.is_some() {
                known.insert(key);
            }
            out.insert(id, value);
        }
        out
    }

    /// Write a batch of key records in parallel; a `None` value means
    /// delete, not set-to-null.
    ///
    /// Every item's remote operation is initiated regardless of sibling
    /// failures; once all have settled, the first failure (if any)
    /// propagates. Losing a key write desynchronizes a specific exchange
    /// and must not be swallowed.
    pub async fn write_keys(
        &self,
        category: &str,
        entries: &HashMap<String, Option<Value>>,
    ) -> Result<(), StoreError> {
        let ops = entries.iter().map(|(id, value)| {
            let key = Self::key_name(category, id);
            async move {
                let result = match value {
                    Some(value) => {
                        let text = serde_json::to_string(value)?;
                        self.kv.set(&key, &text, None).await
                    }
                    None => self.kv.delete(&key).await,
                };
                result.map(|()| (key, value.is_some()))
            }
        });

        let results = join_all(ops).await;
        let mut first_error = None;
        let mut known = self.known_keys.write().await;
        for result in results {
            match result {
                Ok((key, written)) => {
                    if written {
                        known.insert(key);
                    } else {
                        known.remove(&key);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete the credential record and every key record this process has
    /// observed, ahead of a re-pairing.
    pub async fn wipe(&self) -> Result<(), StoreError> {
        let keys: Vec<String> = self.known_keys.read().await.iter().cloned().collect();
        let deletes = keys.iter().map(|key| self.kv.delete(key));
        let creds_delete = self.kv.delete(CREDS_KEY);

        let (key_results, creds_result) = tokio::join!(join_all(deletes), creds_delete);

        self.known_keys.write().await.clear();
        *self.record.write().await = CredentialRecord::fresh();
        *self.coalesce.lock().await = CoalesceState::clean();

        creds_result?;
        for result in key_results {
            result?;
        }
        Ok(())
    }
}
