use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::now_rfc3339;
use crate::proto::{
    ActionInput, ActionRequest, AdminUser, Agent, AgentCapability, Approval, AuditEvent,
    CapabilityType, Decision, ExecutionReceipt, Plan, ReceiptStatus, RequestStatus, Setting,
    StepResult,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("duplicate name: {name}")]
    DuplicateName { name: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Counters {
    agents: i64,
    capabilities: i64,
    requests: i64,
    plans: i64,
    approvals: i64,
    receipts: i64,
    audit_events: i64,
    admins: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreInner {
    counters: Counters,
    agents: Vec<Agent>,
    capabilities: Vec<AgentCapability>,
    settings: Vec<Setting>,
    requests: Vec<ActionRequest>,
    plans: Vec<Plan>,
    approvals: Vec<Approval>,
    receipts: Vec<ExecutionReceipt>,
    audit_events: Vec<AuditEvent>,
    admins: Vec<AdminUser>,
}

/// Single-file JSON store. Every mutation rewrites the snapshot through a
/// temp file + rename so a crash never leaves a half-written database.
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let inner = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                StoreInner::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            StoreInner::default()
        };

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, inner: &StoreInner) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(inner)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // Agents.

    pub fn create_agent(&self, name: &str, api_key_hash: &str) -> Result<Agent, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.agents.iter().any(|a| a.name == name) {
            return Err(StoreError::DuplicateName {
                name: name.to_string(),
            });
        }
        inner.counters.agents += 1;
        let agent = Agent {
            id: inner.counters.agents,
            name: name.to_string(),
            api_key_hash: api_key_hash.to_string(),
            created_at: now_rfc3339(),
            last_seen_at: None,
        };
        inner.agents.push(agent.clone());
        self.persist(&inner)?;
        Ok(agent)
    }

    pub fn get_agent(&self, id: i64) -> Option<Agent> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .agents
            .clone()
    }

    pub fn set_agent_key_hash(&self, id: i64, api_key_hash: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let agent = inner
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound {
                entity: "agent",
                id,
            })?;
        agent.api_key_hash = api_key_hash.to_string();
        self.persist(&inner)?;
        Ok(())
    }

    pub fn touch_agent(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let agent = inner
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound {
                entity: "agent",
                id,
            })?;
        agent.last_seen_at = Some(now_rfc3339());
        self.persist(&inner)?;
        Ok(())
    }

    // Capabilities. Unique by (agent_id, type); absent means blocked.

    pub fn upsert_capability(
        &self,
        agent_id: i64,
        capability: CapabilityType,
        enabled: bool,
        config: Value,
    ) -> Result<AgentCapability, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(existing) = inner
            .capabilities
            .iter_mut()
            .find(|c| c.agent_id == agent_id && c.capability == capability)
        {
            existing.enabled = enabled;
            existing.config = config;
            let updated = existing.clone();
            self.persist(&inner)?;
            return Ok(updated);
        }

        inner.counters.capabilities += 1;
        let record = AgentCapability {
            id: inner.counters.capabilities,
            agent_id,
            capability,
            enabled,
            config,
        };
        inner.capabilities.push(record.clone());
        self.persist(&inner)?;
        Ok(record)
    }

    pub fn capability(&self, agent_id: i64, capability: CapabilityType) -> Option<AgentCapability> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .capabilities
            .iter()
            .find(|c| c.agent_id == agent_id && c.capability == capability)
            .cloned()
    }

    pub fn capabilities_for(&self, agent_id: i64) -> Vec<AgentCapability> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .capabilities
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect()
    }

    // Settings.

    pub fn get_setting(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.clone())
    }

    pub fn put_setting(&self, key: &str, value: Value) -> Result<Setting, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(existing) = inner.settings.iter_mut().find(|s| s.key == key) {
            existing.value = value;
            let updated = existing.clone();
            self.persist(&inner)?;
            return Ok(updated);
        }
        let setting = Setting {
            key: key.to_string(),
            value,
        };
        inner.settings.push(setting.clone());
        self.persist(&inner)?;
        Ok(setting)
    }

    pub fn list_settings(&self) -> Vec<Setting> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .settings
            .clone()
    }

    // Action requests.

    pub fn create_request(
        &self,
        agent_id: i64,
        summary: &str,
        input: ActionInput,
        reasoning_trace: Option<String>,
    ) -> Result<ActionRequest, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.counters.requests += 1;
        let request = ActionRequest {
            id: inner.counters.requests,
            agent_id,
            status: RequestStatus::Pending,
            summary: summary.to_string(),
            input,
            reasoning_trace,
            created_at: now_rfc3339(),
        };
        inner.requests.push(request.clone());
        self.persist(&inner)?;
        Ok(request)
    }

    pub fn get_request(&self, id: i64) -> Option<ActionRequest> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .requests
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn list_requests(&self, status: Option<RequestStatus>) -> Vec<ActionRequest> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut requests: Vec<ActionRequest> = inner
            .requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        requests.reverse();
        requests
    }

    /// Conditional transition (`UPDATE ... WHERE status = expected`). Returns
    /// false without writing when the request is no longer in `expected`,
    /// which makes transitions idempotent and prevents double-approval.
    pub fn transition_request(
        &self,
        id: i64,
        expected: RequestStatus,
        next: RequestStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(request) = inner.requests.iter_mut().find(|r| r.id == id) else {
            return Err(StoreError::NotFound {
                entity: "action request",
                id,
            });
        };
        if request.status != expected {
            return Ok(false);
        }
        request.status = next;
        self.persist(&inner)?;
        Ok(true)
    }

    // Plans.

    pub fn create_plan(
        &self,
        request_id: i64,
        plan_hash: &str,
        steps: Value,
        risk_score: u8,
    ) -> Result<Plan, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.counters.plans += 1;
        let plan = Plan {
            id: inner.counters.plans,
            request_id,
            plan_hash: plan_hash.to_string(),
            steps,
            risk_score,
            created_at: now_rfc3339(),
        };
        inner.plans.push(plan.clone());
        self.persist(&inner)?;
        Ok(plan)
    }

    pub fn get_plan(&self, id: i64) -> Option<Plan> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .plans
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn plans_for_request(&self, request_id: i64) -> Vec<Plan> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .plans
            .iter()
            .filter(|p| p.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Overwrites stored plan steps without touching `plan_hash`. Exists for
    /// recovery tooling; the integrity check at execute time is what makes
    /// any such edit visible.
    pub fn set_plan_steps(&self, id: i64, steps: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let plan = inner
            .plans
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound { entity: "plan", id })?;
        plan.steps = steps;
        self.persist(&inner)?;
        Ok(())
    }

    // Approvals and receipts.

    pub fn create_approval(
        &self,
        plan_id: i64,
        approved_by: i64,
        decision: Decision,
    ) -> Result<Approval, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.counters.approvals += 1;
        let approval = Approval {
            id: inner.counters.approvals,
            plan_id,
            approved_by,
            decision,
            created_at: now_rfc3339(),
        };
        inner.approvals.push(approval.clone());
        self.persist(&inner)?;
        Ok(approval)
    }

    pub fn create_receipt(
        &self,
        plan_id: i64,
        status: ReceiptStatus,
        logs: Vec<StepResult>,
    ) -> Result<ExecutionReceipt, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.counters.receipts += 1;
        let receipt = ExecutionReceipt {
            id: inner.counters.receipts,
            plan_id,
            status,
            logs,
            executed_at: now_rfc3339(),
        };
        inner.receipts.push(receipt.clone());
        self.persist(&inner)?;
        Ok(receipt)
    }

    pub fn receipts_for_plan(&self, plan_id: i64) -> Vec<ExecutionReceipt> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .receipts
            .iter()
            .filter(|r| r.plan_id == plan_id)
            .cloned()
            .collect()
    }

    // Audit events. Chain ordering is enforced by the ledger's writer lock;
    // the store only provides atomic insert-and-number.

    pub fn last_audit_event(&self) -> Option<AuditEvent> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .audit_events
            .last()
            .cloned()
    }

    pub fn insert_audit_event(
        &self,
        prev_hash: &str,
        event_hash: &str,
        event_type: &str,
        data: Value,
    ) -> Result<AuditEvent, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.counters.audit_events += 1;
        let event = AuditEvent {
            id: inner.counters.audit_events,
            prev_hash: prev_hash.to_string(),
            event_hash: event_hash.to_string(),
            event_type: event_type.to_string(),
            data,
            created_at: now_rfc3339(),
        };
        inner.audit_events.push(event.clone());
        self.persist(&inner)?;
        Ok(event)
    }

    pub fn list_audit_events(&self) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .audit_events
            .clone()
    }

    // Admin users.

    pub fn create_admin(&self, username: &str, password_hash: &str) -> Result<AdminUser, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.admins.iter().any(|a| a.username == username) {
            return Err(StoreError::DuplicateName {
                name: username.to_string(),
            });
        }
        inner.counters.admins += 1;
        let admin = AdminUser {
            id: inner.counters.admins,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now_rfc3339(),
        };
        inner.admins.push(admin.clone());
        self.persist(&inner)?;
        Ok(admin)
    }

    pub fn admin_by_username(&self, username: &str) -> Option<AdminUser> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .admins
            .iter()
            .find(|a| a.username == username)
            .cloned()
    }

    pub fn get_admin(&self, id: i64) -> Option<AdminUser> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .admins
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn admin_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").admins.len()
    }
}
