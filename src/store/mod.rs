//! Durable credential state.
//!
//! Splits one device's session state into a coalesced `creds` record and
//! many independently durable `key-<category>-<id>` records, all persisted
//! through a remote key-value service.

pub mod credentials;
pub mod encoding;
pub mod kv;

pub use credentials::{
    CoalesceState, CredentialRecord, CredentialStore, DeviceIdentity, KeyPair, SignedPreKey,
    CREDS_KEY,
};
pub use encoding::Binary;
pub use kv::{HttpKvStore, KvStore, MemoryKvStore};
