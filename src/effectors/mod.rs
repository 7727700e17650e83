use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::proto::{CapabilityType, PlanStep, StepResult};

pub mod echo;
pub mod filesystem;
pub mod network;
pub mod shell;

#[derive(Debug, Error)]
pub enum EffectorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Per-request snapshot of the sandbox policy. Taken once at the start of a
/// handler; later settings changes apply to subsequent requests.
#[derive(Debug, Clone)]
pub struct EffectorContext {
    pub allowed_roots: Vec<PathBuf>,
    pub shell_allow_list: Vec<String>,
    pub safe_mode: bool,
    pub agent_id: i64,
    pub request_id: i64,
}

/// A capability plugin: validates raw params, expands a request into an
/// inspectable step list, and executes approved steps. Implementations must
/// not perform side effects outside `execute` (the one exception: reading an
/// existing file to build a diff during dry-run).
#[async_trait]
pub trait Effector: Send + Sync {
    fn capability_type(&self) -> CapabilityType;

    fn default_config(&self) -> Value;

    /// Returns normalized params, or the list of validation problems.
    fn validate_request(&self, operation: &str, params: &Value) -> Result<Value, Vec<String>>;

    fn dry_run(
        &self,
        ctx: &EffectorContext,
        operation: &str,
        params: &Value,
    ) -> Result<Vec<PlanStep>, EffectorError>;

    async fn execute(&self, ctx: &EffectorContext, steps: &[PlanStep]) -> Vec<StepResult>;
}

/// Resolves to an absolute, lexically normalized path. `..` and `.` segments
/// are collapsed without touching the filesystem; symlinks are not resolved.
pub fn resolve_absolute(path: &str) -> PathBuf {
    let p = Path::new(path);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(p)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push("/");
    }
    normalized
}

/// Absolute-prefix sandbox check, component-wise so `/tmp/sbx2` never passes
/// for root `/tmp/sbx`.
pub fn is_path_allowed(path: &Path, allowed_roots: &[PathBuf]) -> bool {
    allowed_roots.iter().any(|root| path.starts_with(root))
}

#[derive(Default)]
pub struct EffectorRegistry {
    plugins: HashMap<CapabilityType, Arc<dyn Effector>>,
}

impl EffectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-registering a capability type keeps the first plugin.
    pub fn register(&mut self, plugin: Arc<dyn Effector>) {
        let capability = plugin.capability_type();
        if self.plugins.contains_key(&capability) {
            warn!(capability = capability.as_str(), "effector already registered, ignoring");
            return;
        }
        self.plugins.insert(capability, plugin);
    }

    pub fn get(&self, capability: CapabilityType) -> Option<Arc<dyn Effector>> {
        self.plugins.get(&capability).cloned()
    }

    /// Builtins, registered in a fixed order at startup.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(filesystem::FilesystemEffector));
        registry.register(Arc::new(shell::ShellEffector));
        registry.register(Arc::new(network::NetworkEffector));
        registry.register(Arc::new(echo::EchoEffector));
        registry
    }
}
