use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default = "default_requests_per_minute")]
    pub max_requests_per_minute: u32,
}

fn default_requests_per_minute() -> u32 {
    30
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Per-agent request budget over a sliding one-minute window. This is the
/// rate-limit collaborator consulted by `create_request`; execution is gated
/// separately by approval, so a racy window here costs at most one extra
/// pending request.
pub struct PolicyEngine {
    config: PolicyConfig,
    windows: Mutex<HashMap<i64, Vec<DateTime<Utc>>>>,
}

impl PolicyEngine {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let content = fs::read_to_string(path)?;
        let config: PolicyConfig = toml::from_str(&content)?;
        Ok(Self::from_config(config))
    }

    /// Loads the policy file when present, otherwise runs on defaults.
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::from_config(PolicyConfig::default()))
        }
    }

    pub fn from_config(config: PolicyConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request for `agent_id` if the budget allows it; returns a
    /// deny reason otherwise.
    pub fn check_and_record(&self, agent_id: i64) -> Result<(), String> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(60);

        let mut windows = self.windows.lock().expect("policy lock poisoned");
        let window = windows.entry(agent_id).or_default();
        window.retain(|t| *t > cutoff);

        if window.len() as u32 >= self.config.max_requests_per_minute {
            return Err(format!(
                "agent exceeded {} requests per minute",
                self.config.max_requests_per_minute
            ));
        }

        window.push(now);
        Ok(())
    }
}
