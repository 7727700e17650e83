use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use thiserror::Error;
use tracing::warn;

use crate::crypto::{constant_time_eq, hash_api_key, sha256_hex};
use crate::proto::Agent;
use crate::store::{Store, StoreError};

pub const SESSION_COOKIE: &str = "warden_session";
const SESSION_TTL_HOURS: i64 = 24;
const BCRYPT_COST: u32 = 12;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    bcrypt::verify(password, stored_hash).unwrap_or(false)
}

/// O(n) scan over agents with a constant-time digest comparison; fine for a
/// local-first fleet of agents.
pub fn find_agent_by_key(store: &Store, plaintext_key: &str) -> Option<Agent> {
    let digest = hash_api_key(plaintext_key);
    store
        .list_agents()
        .into_iter()
        .find(|agent| constant_time_eq(agent.api_key_hash.as_bytes(), digest.as_bytes()))
}

/// Seeds the initial admin user when the store has none. The password comes
/// from `ADMIN_PASSWORD` or is generated and logged exactly once.
pub fn seed_admin(store: &Store, configured_password: Option<String>) -> Result<(), AuthError> {
    if store.admin_count() > 0 {
        return Ok(());
    }

    let (password, generated) = match configured_password {
        Some(p) if !p.is_empty() => (p, false),
        _ => (generate_password(), true),
    };

    let hash = hash_password(&password)?;
    store.create_admin("admin", &hash)?;
    if generated {
        warn!("created admin user 'admin' with generated password: {password}");
    } else {
        tracing::info!("created admin user 'admin'");
    }
    Ok(())
}

fn generate_password() -> String {
    let mut raw = [0u8; 12];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

struct Session {
    admin_id: i64,
    expires_at: DateTime<Utc>,
}

/// Server-side sessions. The cookie value is `token.tag` where
/// `tag = sha256(secret || token)`, so a leaked session map alone cannot be
/// replayed without the process secret.
pub struct SessionManager {
    secret: String,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, admin_id: i64) -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        let cookie = format!("{}.{}", token, self.tag(&token));

        self.sessions
            .lock()
            .expect("session lock poisoned")
            .insert(
                token,
                Session {
                    admin_id,
                    expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
                },
            );
        cookie
    }

    pub fn resolve(&self, cookie_value: &str) -> Option<i64> {
        let (token, tag) = cookie_value.split_once('.')?;
        if !constant_time_eq(self.tag(token).as_bytes(), tag.as_bytes()) {
            return None;
        }

        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => Some(session.admin_id),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn destroy(&self, cookie_value: &str) {
        if let Some((token, _)) = cookie_value.split_once('.') {
            self.sessions
                .lock()
                .expect("session lock poisoned")
                .remove(token);
        }
    }

    fn tag(&self, token: &str) -> String {
        sha256_hex(&format!("{}{}", self.secret, token))
    }
}
