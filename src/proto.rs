use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Filesystem,
    Shell,
    Network,
    Echo,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Filesystem => "filesystem",
            CapabilityType::Shell => "shell",
            CapabilityType::Network => "network",
            CapabilityType::Echo => "echo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filesystem" => Some(CapabilityType::Filesystem),
            "shell" => Some(CapabilityType::Shell),
            "network" => Some(CapabilityType::Network),
            "echo" => Some(CapabilityType::Echo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Planned,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl RequestStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "planned" => Some(RequestStatus::Planned),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            "executed" => Some(RequestStatus::Executed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Planned => "planned",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Executed => "executed",
            RequestStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    FsRead,
    FsWrite,
    FsDelete,
    FsList,
    FsMove,
    ShellRun,
    NetAllow,
    Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Failure,
    PartialFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub api_key_hash: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapability {
    pub id: i64,
    pub agent_id: i64,
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    pub enabled: bool,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub id: i64,
    pub agent_id: i64,
    pub status: RequestStatus,
    pub summary: String,
    pub input: ActionInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
    pub created_at: String,
}

/// One executable unit of a plan. The serialized form of the step list is the
/// input to `plan_hash`, so field names here are part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub step_id: Uuid,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub description: String,
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
}

impl PlanStep {
    pub fn new(step_type: StepType, description: impl Into<String>, inputs: Value) -> Self {
        Self {
            step_id: Uuid::new_v4(),
            step_type,
            description: description.into(),
            inputs,
            preview: None,
            diff: None,
            risk_flags: Vec::new(),
            risk_score: None,
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.risk_flags.push(flag.into());
        self
    }
}

/// `steps` is kept as the raw JSON value produced at dry-run time and is never
/// rewritten between storage and execution; `plan_hash` is recomputed over it
/// at execute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: i64,
    pub request_id: i64,
    pub plan_hash: String,
    pub steps: Value,
    pub risk_score: u8,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: i64,
    pub plan_id: i64,
    pub approved_by: i64,
    pub decision: Decision,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: Uuid,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub timestamp: String,
}

impl StepResult {
    pub fn success(step_id: Uuid, output: impl Into<String>) -> Self {
        Self {
            step_id,
            status: StepStatus::Success,
            output: Some(output.into()),
            error: None,
            stdout: None,
            stderr: None,
            timestamp: crate::crypto::now_rfc3339(),
        }
    }

    pub fn failed(step_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            step_id,
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            stdout: None,
            stderr: None,
            timestamp: crate::crypto::now_rfc3339(),
        }
    }

    pub fn blocked(step_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            step_id,
            status: StepStatus::Blocked,
            output: None,
            error: Some(error.into()),
            stdout: None,
            stderr: None,
            timestamp: crate::crypto::now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub id: i64,
    pub plan_id: i64,
    pub status: ReceiptStatus,
    pub logs: Vec<StepResult>,
    pub executed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: i64,
    pub prev_hash: String,
    pub event_hash: String,
    pub event_type: String,
    pub data: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    pub total_risk_score: u8,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub flags_top: Vec<String>,
}

// Wire bodies.

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminView {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

impl From<&Agent> for AgentView {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            created_at: agent.created_at.clone(),
            last_seen_at: agent.last_seen_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWithCapabilities {
    #[serde(flatten)]
    pub agent: AgentView,
    pub capabilities: Vec<AgentCapability>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentResponse {
    pub agent: AgentView,
    /// Plaintext key, shown exactly once.
    pub api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyResponse {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCapabilityRequest {
    pub enabled: bool,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertSettingRequest {
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct ApprovePlanRequest {
    pub decision: Decision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SafeModeBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionBody {
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionResponse {
    pub request_id: i64,
    pub status: RequestStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResponse {
    pub plan_id: i64,
    pub steps: Vec<PlanStep>,
    pub risk_score: u8,
    pub risk_summary: RiskSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetail {
    #[serde(flatten)]
    pub request: ActionRequest,
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditListResponse {
    pub events: Vec<AuditEvent>,
    pub chain_valid: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockdownResponse {
    pub safe_mode: bool,
    pub agents_affected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: Value,
}

pub mod settings {
    pub const ALLOWED_ROOTS: &str = "allowed_roots";
    pub const SHELL_ALLOWLIST: &str = "shell_allowlist";
    pub const SAFE_MODE: &str = "safe_mode";
}
