use std::env;
use std::path::PathBuf;

use crate::crypto::random_token;

/// Environment-driven server configuration. Every knob has a local-first
/// default so `warden` starts with no setup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub session_secret: String,
    pub database_path: PathBuf,
    pub sandbox_path: PathBuf,
    pub policy_path: PathBuf,
    pub admin_password: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5000);

        // A missing secret gets a process-lifetime random one; sessions are
        // in-memory anyway, so they never outlive the process.
        let session_secret = env::var("SESSION_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(random_token);

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/warden.json"));

        let sandbox_path = env::var("SANDBOX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sandbox"));

        let policy_path = env::var("POLICY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/policy.toml"));

        let admin_password = env::var("ADMIN_PASSWORD").ok().filter(|p| !p.is_empty());

        Self {
            port,
            session_secret,
            database_path,
            sandbox_path,
            policy_path,
            admin_password,
        }
    }
}
