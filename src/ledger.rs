use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use thiserror::Error;

use crate::crypto::{canonical_json, now_rfc3339, sha256_hex, CryptoError};
use crate::proto::AuditEvent;
use crate::store::{Store, StoreError};

pub const GENESIS: &str = "GENESIS";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("hash chain broken at event id={0}")]
    ChainBroken(i64),
}

/// Append-only audit log on top of the store. Appends are serialized behind a
/// writer lock so concurrent events always produce a linear
/// `prev_hash -> event_hash` chain with no gaps.
pub struct AuditLog {
    store: Arc<Store>,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
        }
    }

    /// Appends one event. The stored `data` column holds the full hashed
    /// payload `{eventType, data, timestamp}` so third parties can re-derive
    /// `event_hash = sha256(prev_hash + canonical_json(data))`.
    pub fn append(&self, event_type: &str, data: Value) -> Result<AuditEvent, LedgerError> {
        let _guard = self.writer.lock().expect("audit writer lock poisoned");

        let prev_hash = self
            .store
            .last_audit_event()
            .map(|e| e.event_hash)
            .unwrap_or_else(|| GENESIS.to_string());

        let payload = json!({
            "eventType": event_type,
            "data": data,
            "timestamp": now_rfc3339(),
        });
        let event_hash = sha256_hex(&format!("{}{}", prev_hash, canonical_json(&payload)?));

        let event = self
            .store
            .insert_audit_event(&prev_hash, &event_hash, event_type, payload)?;
        Ok(event)
    }

    /// Walks the chain by id ascending and re-derives every hash. Any edit to
    /// a stored event, or any insertion/removal, breaks the walk.
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        let mut prev_hash = GENESIS.to_string();
        for event in self.store.list_audit_events() {
            if event.prev_hash != prev_hash {
                return Err(LedgerError::ChainBroken(event.id));
            }
            let expected = sha256_hex(&format!("{}{}", prev_hash, canonical_json(&event.data)?));
            if expected != event.event_hash {
                return Err(LedgerError::ChainBroken(event.id));
            }
            prev_hash = event.event_hash;
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.store.list_audit_events()
    }
}
