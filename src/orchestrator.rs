use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tracing::info;

use crate::crypto::{canonical_json, generate_api_key, sha256_hex};
use crate::effectors::{resolve_absolute, Effector, EffectorContext, EffectorError, EffectorRegistry};
use crate::error::ApiError;
use crate::ledger::AuditLog;
use crate::policy::PolicyEngine;
use crate::proto::{
    settings, ActionInput, ActionRequest, Agent, AgentCapability, Approval, CapabilityType,
    CreateActionBody, Decision, ExecutionReceipt, Plan, PlanStep, ReceiptStatus, RequestStatus,
    RiskSummary, Setting,
};
use crate::risk::{score_plan, score_step};
use crate::store::Store;

#[derive(Debug)]
pub struct DryRunOutcome {
    pub plan: Plan,
    pub steps: Vec<PlanStep>,
    pub risk_summary: RiskSummary,
}

/// Drives the request lifecycle: every operation here enforces its state
/// preconditions, performs the effector call where one applies, and emits
/// exactly one audit event per committed transition.
pub struct Orchestrator {
    store: Arc<Store>,
    registry: Arc<EffectorRegistry>,
    audit: Arc<AuditLog>,
    policy: Arc<PolicyEngine>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<EffectorRegistry>,
        audit: Arc<AuditLog>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    // Agent-facing lifecycle.

    pub fn create_request(
        &self,
        agent_id: i64,
        body: CreateActionBody,
    ) -> Result<ActionRequest, ApiError> {
        self.policy
            .check_and_record(agent_id)
            .map_err(ApiError::rate_limit)?;

        let capability = self.store.capability(agent_id, body.capability);
        if !capability.map(|c| c.enabled).unwrap_or(false) {
            return Err(ApiError::authorization(format!(
                "capability {} is not enabled for this agent",
                body.capability.as_str()
            )));
        }

        let plugin = self.plugin(body.capability)?;
        let normalized = plugin
            .validate_request(&body.operation, &body.params)
            .map_err(|errors| ApiError::validation(errors.join("; ")))?;

        let summary = summarize(body.capability, &body.operation, &normalized);
        let input = ActionInput {
            capability: body.capability,
            operation: body.operation.clone(),
            params: normalized,
        };

        let request = self
            .store
            .create_request(agent_id, &summary, input, body.reasoning)?;
        self.audit_event(
            "REQUEST_CREATED",
            json!({
                "requestId": request.id,
                "agentId": agent_id,
                "type": body.capability.as_str(),
                "operation": body.operation,
            }),
        )?;

        info!(request_id = request.id, agent_id, "action request created");
        Ok(request)
    }

    pub fn dry_run(&self, agent_id: i64, request_id: i64) -> Result<DryRunOutcome, ApiError> {
        let request = self
            .store
            .get_request(request_id)
            .ok_or_else(|| ApiError::not_found(format!("action request {request_id}")))?;
        if request.agent_id != agent_id {
            return Err(ApiError::authorization(
                "action request belongs to another agent",
            ));
        }
        if !matches!(
            request.status,
            RequestStatus::Pending | RequestStatus::Planned
        ) {
            return Err(ApiError::state(format!(
                "request is {}, dry-run requires pending or planned",
                request.status.as_str()
            )));
        }

        let plugin = self.plugin(request.input.capability)?;
        let normalized = plugin
            .validate_request(&request.input.operation, &request.input.params)
            .map_err(|errors| ApiError::validation(errors.join("; ")))?;

        let ctx = self.effector_context(agent_id, request_id);
        let mut steps = plugin
            .dry_run(&ctx, &request.input.operation, &normalized)
            .map_err(effector_error)?;

        for step in &mut steps {
            let scored = score_step(step);
            step.risk_flags = scored.flags;
            step.risk_score = Some(scored.score);
        }

        let steps_value = serde_json::to_value(&steps)
            .map_err(|err| ApiError::internal(format!("step serialization failed: {err}")))?;
        let plan_hash = sha256_hex(&canonical_json(&steps_value)?);
        let risk_summary = score_plan(&steps);

        let plan = self.store.create_plan(
            request_id,
            &plan_hash,
            steps_value,
            risk_summary.total_risk_score,
        )?;
        self.store
            .transition_request(request_id, RequestStatus::Pending, RequestStatus::Planned)?;

        self.audit_event(
            "DRY_RUN_COMPLETE",
            json!({
                "requestId": request_id,
                "planId": plan.id,
                "planHash": plan.plan_hash,
                "riskScore": risk_summary.total_risk_score,
                "stepCount": steps.len(),
            }),
        )?;

        Ok(DryRunOutcome {
            plan,
            steps,
            risk_summary,
        })
    }

    pub async fn execute_plan(
        &self,
        agent_id: i64,
        plan_id: i64,
    ) -> Result<ExecutionReceipt, ApiError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .ok_or_else(|| ApiError::not_found(format!("plan {plan_id}")))?;
        let request = self
            .store
            .get_request(plan.request_id)
            .ok_or_else(|| ApiError::internal("plan has no owning request"))?;

        if request.agent_id != agent_id {
            return Err(ApiError::authorization("plan belongs to another agent"));
        }
        if request.status != RequestStatus::Approved {
            return Err(ApiError::state(format!(
                "request is {}, execution requires approved",
                request.status.as_str()
            )));
        }

        // Integrity gate: the hash is re-derived from the stored steps after
        // the plan row is read, so any tampering between approval and
        // execution is caught here.
        let derived = sha256_hex(&canonical_json(&plan.steps)?);
        if derived != plan.plan_hash {
            return Err(ApiError::integrity("plan hash mismatch"));
        }

        let steps: Vec<PlanStep> = serde_json::from_value(plan.steps.clone())
            .map_err(|err| ApiError::internal(format!("stored steps are unreadable: {err}")))?;

        let plugin = self.plugin(request.input.capability)?;
        let ctx = self.effector_context(agent_id, request.id);

        let executed = AssertUnwindSafe(plugin.execute(&ctx, &steps))
            .catch_unwind()
            .await;

        let (results, panicked) = match executed {
            Ok(results) => (results, false),
            Err(_) => (Vec::new(), true),
        };

        let succeeded = results
            .iter()
            .filter(|r| r.status == crate::proto::StepStatus::Success)
            .count();
        let receipt_status = if panicked || (succeeded == 0 && !steps.is_empty()) {
            ReceiptStatus::Failure
        } else if succeeded == results.len() {
            ReceiptStatus::Success
        } else {
            ReceiptStatus::PartialFailure
        };
        let next_status = match receipt_status {
            ReceiptStatus::Failure => RequestStatus::Failed,
            _ => RequestStatus::Executed,
        };

        let receipt = self
            .store
            .create_receipt(plan.id, receipt_status, results)?;
        self.store
            .transition_request(request.id, RequestStatus::Approved, next_status)?;
        self.audit_event(
            "PLAN_EXECUTED",
            json!({
                "planId": plan.id,
                "requestId": request.id,
                "receiptId": receipt.id,
                "agentId": agent_id,
                "status": receipt.status,
            }),
        )?;

        if panicked {
            return Err(ApiError::internal("effector panicked during execution"));
        }
        Ok(receipt)
    }

    // Admin operations.

    pub fn approve_plan(
        &self,
        admin_id: i64,
        plan_id: i64,
        decision: Decision,
    ) -> Result<(Approval, ActionRequest), ApiError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .ok_or_else(|| ApiError::not_found(format!("plan {plan_id}")))?;
        let request = self
            .store
            .get_request(plan.request_id)
            .ok_or_else(|| ApiError::internal("plan has no owning request"))?;

        let next = match decision {
            Decision::Approved => RequestStatus::Approved,
            Decision::Rejected => RequestStatus::Rejected,
        };

        match request.status {
            RequestStatus::Planned => {}
            RequestStatus::Approved | RequestStatus::Rejected => {
                return Err(ApiError::conflict("plan has already been decided"));
            }
            other => {
                return Err(ApiError::state(format!(
                    "request is {}, approval requires planned",
                    other.as_str()
                )));
            }
        }

        let transitioned =
            self.store
                .transition_request(request.id, RequestStatus::Planned, next)?;
        if !transitioned {
            return Err(ApiError::conflict("plan has already been decided"));
        }

        let approval = self.store.create_approval(plan_id, admin_id, decision)?;
        self.audit_event(
            "PLAN_DECISION",
            json!({
                "planId": plan_id,
                "requestId": request.id,
                "decision": decision,
                "approvedBy": admin_id,
            }),
        )?;

        let request = self
            .store
            .get_request(request.id)
            .ok_or_else(|| ApiError::internal("request vanished"))?;
        Ok((approval, request))
    }

    pub fn create_agent(&self, admin_id: i64, name: &str) -> Result<(Agent, String), ApiError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::validation("agent name is required"));
        }

        let (plaintext, hash) = generate_api_key();
        let agent = self.store.create_agent(name, &hash)?;
        self.audit_event(
            "AGENT_CREATED",
            json!({ "agentId": agent.id, "name": agent.name, "createdBy": admin_id }),
        )?;
        Ok((agent, plaintext))
    }

    pub fn rotate_agent_key(&self, admin_id: i64, agent_id: i64) -> Result<String, ApiError> {
        if self.store.get_agent(agent_id).is_none() {
            return Err(ApiError::not_found(format!("agent {agent_id}")));
        }

        let (plaintext, hash) = generate_api_key();
        self.store.set_agent_key_hash(agent_id, &hash)?;
        self.audit_event(
            "AGENT_KEY_ROTATED",
            json!({ "agentId": agent_id, "rotatedBy": admin_id }),
        )?;
        Ok(plaintext)
    }

    pub fn update_capability(
        &self,
        admin_id: i64,
        agent_id: i64,
        capability: CapabilityType,
        enabled: bool,
        config: Option<Value>,
    ) -> Result<AgentCapability, ApiError> {
        if self.store.get_agent(agent_id).is_none() {
            return Err(ApiError::not_found(format!("agent {agent_id}")));
        }

        let plugin = self.plugin(capability)?;
        let config = config
            .or_else(|| {
                self.store
                    .capability(agent_id, capability)
                    .map(|c| c.config)
            })
            .unwrap_or_else(|| plugin.default_config());

        let record = self
            .store
            .upsert_capability(agent_id, capability, enabled, config)?;
        self.audit_event(
            "CAPABILITY_UPDATED",
            json!({
                "agentId": agent_id,
                "type": capability.as_str(),
                "enabled": enabled,
                "updatedBy": admin_id,
            }),
        )?;
        Ok(record)
    }

    pub fn update_setting(
        &self,
        admin_id: i64,
        key: &str,
        value: Value,
    ) -> Result<Setting, ApiError> {
        validate_setting(key, &value)?;
        let setting = self.store.put_setting(key, value)?;

        if key == settings::SAFE_MODE {
            self.audit_event(
                "SAFE_MODE_CHANGED",
                json!({
                    "enabled": setting.value.as_bool().unwrap_or(false),
                    "changedBy": admin_id,
                }),
            )?;
        } else {
            self.audit_event(
                "SETTING_UPDATED",
                json!({ "key": key, "updatedBy": admin_id }),
            )?;
        }
        Ok(setting)
    }

    pub fn set_safe_mode(&self, admin_id: i64, enabled: bool) -> Result<(), ApiError> {
        self.update_setting(admin_id, settings::SAFE_MODE, json!(enabled))?;
        Ok(())
    }

    pub fn safe_mode(&self) -> bool {
        self.store
            .get_setting(settings::SAFE_MODE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Enables safe mode and revokes every agent by replacing its key hash
    /// with a freshly generated one; the new plaintexts are dropped on the
    /// floor, so existing credentials stop working immediately.
    pub fn emergency_lockdown(&self, admin_id: i64) -> Result<usize, ApiError> {
        self.store
            .put_setting(settings::SAFE_MODE, json!(true))?;

        let agents = self.store.list_agents();
        for agent in &agents {
            let (_discarded, hash) = generate_api_key();
            self.store.set_agent_key_hash(agent.id, &hash)?;
        }

        self.audit_event(
            "EMERGENCY_LOCKDOWN",
            json!({
                "severity": "critical",
                "agentsAffected": agents.len(),
                "triggeredBy": admin_id,
            }),
        )?;

        info!(agents_affected = agents.len(), "emergency lockdown engaged");
        Ok(agents.len())
    }

    // Shared plumbing.

    fn plugin(&self, capability: CapabilityType) -> Result<Arc<dyn Effector>, ApiError> {
        self.registry.get(capability).ok_or_else(|| {
            ApiError::internal(format!(
                "no effector registered for {}",
                capability.as_str()
            ))
        })
    }

    fn effector_context(&self, agent_id: i64, request_id: i64) -> EffectorContext {
        let allowed_roots: Vec<PathBuf> = self
            .store
            .get_setting(settings::ALLOWED_ROOTS)
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| p.as_str().map(resolve_absolute))
                    .collect()
            })
            .unwrap_or_default();

        let shell_allow_list: Vec<String> = self
            .store
            .get_setting(settings::SHELL_ALLOWLIST)
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        EffectorContext {
            allowed_roots,
            shell_allow_list,
            safe_mode: self.safe_mode(),
            agent_id,
            request_id,
        }
    }

    fn audit_event(&self, event_type: &str, data: Value) -> Result<(), ApiError> {
        self.audit
            .append(event_type, data)
            .map_err(|err| ApiError::internal(format!("audit append failed: {err}")))?;
        Ok(())
    }
}

fn effector_error(err: EffectorError) -> ApiError {
    match err {
        EffectorError::UnsupportedOperation(op) => {
            ApiError::validation(format!("unsupported operation: {op}"))
        }
        EffectorError::Io(err) => ApiError::internal(format!("effector io error: {err}")),
    }
}

fn validate_setting(key: &str, value: &Value) -> Result<(), ApiError> {
    match key {
        settings::ALLOWED_ROOTS => {
            let Some(items) = value.as_array() else {
                return Err(ApiError::validation("allowed_roots must be an array"));
            };
            for item in items {
                match item.as_str() {
                    Some(path) if path.starts_with('/') => {}
                    _ => {
                        return Err(ApiError::validation(
                            "allowed_roots entries must be absolute paths",
                        ))
                    }
                }
            }
        }
        settings::SHELL_ALLOWLIST => {
            let Some(items) = value.as_array() else {
                return Err(ApiError::validation("shell_allowlist must be an array"));
            };
            if !items.iter().all(|i| i.is_string()) {
                return Err(ApiError::validation(
                    "shell_allowlist entries must be strings",
                ));
            }
        }
        settings::SAFE_MODE => {
            if !value.is_boolean() {
                return Err(ApiError::validation("safe_mode must be a boolean"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn summarize(capability: CapabilityType, operation: &str, params: &Value) -> String {
    let subject = params
        .get("path")
        .or_else(|| params.get("from"))
        .or_else(|| params.get("command"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            params.get("domains").and_then(|v| v.as_array()).map(|d| {
                d.iter()
                    .filter_map(|x| x.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
        });

    match subject {
        Some(subject) => format!("{} {} {}", capability.as_str(), operation, subject),
        None => format!("{} {}", capability.as_str(), operation),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use crate::effectors::EffectorRegistry;
    use crate::policy::{PolicyConfig, PolicyEngine};
    use crate::proto::StepType;

    use super::*;

    struct Harness {
        _dir: TempDir,
        sandbox: PathBuf,
        orchestrator: Orchestrator,
        agent: Agent,
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let sandbox = dir.path().join("sandbox");
        std::fs::create_dir_all(&sandbox).expect("sandbox");

        let store = Arc::new(Store::open(dir.path().join("db.json")).expect("store"));
        store
            .put_setting(
                settings::ALLOWED_ROOTS,
                json!([sandbox.display().to_string()]),
            )
            .expect("roots");
        store
            .put_setting(settings::SHELL_ALLOWLIST, json!(["^(ls|echo|rm)( .*)?$"]))
            .expect("allowlist");

        let audit = Arc::new(AuditLog::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(EffectorRegistry::builtin()),
            audit,
            Arc::new(PolicyEngine::from_config(PolicyConfig {
                max_requests_per_minute: 100,
            })),
        );

        let (agent, _key) = orchestrator.create_agent(1, "test-agent").expect("agent");
        orchestrator
            .update_capability(1, agent.id, CapabilityType::Filesystem, true, None)
            .expect("fs capability");
        orchestrator
            .update_capability(1, agent.id, CapabilityType::Shell, true, None)
            .expect("shell capability");

        Harness {
            _dir: dir,
            sandbox,
            orchestrator,
            agent,
        }
    }

    fn read_request(h: &Harness, path: &str) -> ActionRequest {
        h.orchestrator
            .create_request(
                h.agent.id,
                CreateActionBody {
                    capability: CapabilityType::Filesystem,
                    operation: "read".to_string(),
                    params: json!({ "path": path }),
                    reasoning: None,
                },
            )
            .expect("create request")
    }

    #[tokio::test]
    async fn happy_path_read_lifecycle() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let request = read_request(&h, &file.display().to_string());
        assert_eq!(request.status, RequestStatus::Pending);

        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].step_type, StepType::FsRead);
        assert_eq!(outcome.risk_summary.total_risk_score, 5);
        assert_eq!(
            h.orchestrator.store().get_request(request.id).expect("req").status,
            RequestStatus::Planned
        );

        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Approved)
            .expect("approve");

        let receipt = h
            .orchestrator
            .execute_plan(h.agent.id, outcome.plan.id)
            .await
            .expect("execute");
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert!(receipt.logs[0].output.as_deref().expect("output").starts_with("hello"));
        assert_eq!(
            h.orchestrator.store().get_request(request.id).expect("req").status,
            RequestStatus::Executed
        );
    }

    #[tokio::test]
    async fn denied_path_plans_but_never_reads() {
        let h = harness();
        let request = read_request(&h, "/etc/passwd");

        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");
        assert!(outcome.steps[0]
            .risk_flags
            .iter()
            .any(|f| f == crate::risk::flags::PATH_DENIED));
        assert_eq!(outcome.steps[0].risk_score, Some(50));

        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Approved)
            .expect("approve");
        let receipt = h
            .orchestrator
            .execute_plan(h.agent.id, outcome.plan.id)
            .await
            .expect("receipt");

        // The step is blocked, never performed; the request ends failed.
        assert_eq!(receipt.status, ReceiptStatus::Failure);
        assert_eq!(receipt.logs[0].status, crate::proto::StepStatus::Blocked);
        assert_eq!(
            h.orchestrator.store().get_request(request.id).expect("req").status,
            RequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn tampered_plan_is_rejected_with_integrity() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let request = read_request(&h, &file.display().to_string());
        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");
        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Approved)
            .expect("approve");

        // Overwrite a step description directly in the store.
        let mut steps = outcome.plan.steps.clone();
        steps[0]["description"] = json!("Read something else entirely");
        h.orchestrator
            .store()
            .set_plan_steps(outcome.plan.id, steps)
            .expect("tamper");

        let err = h
            .orchestrator
            .execute_plan(h.agent.id, outcome.plan.id)
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "INTEGRITY");

        // Request stays approved; no receipt, no PLAN_EXECUTED event.
        assert_eq!(
            h.orchestrator.store().get_request(request.id).expect("req").status,
            RequestStatus::Approved
        );
        assert!(h
            .orchestrator
            .store()
            .receipts_for_plan(outcome.plan.id)
            .is_empty());
        assert!(!h
            .orchestrator
            .audit()
            .events()
            .iter()
            .any(|e| e.event_type == "PLAN_EXECUTED"));
    }

    #[tokio::test]
    async fn execute_requires_approval() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let request = read_request(&h, &file.display().to_string());
        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");

        let err = h
            .orchestrator
            .execute_plan(h.agent.id, outcome.plan.id)
            .await
            .expect_err("not approved");
        assert_eq!(err.code(), "STATE");
    }

    #[test]
    fn double_decision_is_a_conflict() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let request = read_request(&h, &file.display().to_string());
        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");

        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Approved)
            .expect("first decision");
        let err = h
            .orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Rejected)
            .expect_err("second decision");
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn rejected_request_cannot_be_replanned() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let request = read_request(&h, &file.display().to_string());
        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");
        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Rejected)
            .expect("reject");

        let err = h
            .orchestrator
            .dry_run(h.agent.id, request.id)
            .expect_err("terminal state");
        assert_eq!(err.code(), "STATE");
    }

    #[test]
    fn disabled_capability_is_rejected_without_persistence() {
        let h = harness();
        let before = h.orchestrator.store().list_requests(None).len();

        let err = h
            .orchestrator
            .create_request(
                h.agent.id,
                CreateActionBody {
                    capability: CapabilityType::Network,
                    operation: "allow".to_string(),
                    params: json!({"domains": ["example.com"]}),
                    reasoning: None,
                },
            )
            .expect_err("network not enabled");
        assert_eq!(err.code(), "AUTHORIZATION");
        assert_eq!(h.orchestrator.store().list_requests(None).len(), before);
    }

    #[test]
    fn invalid_params_are_rejected_without_persistence() {
        let h = harness();
        let before = h.orchestrator.store().list_requests(None).len();

        let err = h
            .orchestrator
            .create_request(
                h.agent.id,
                CreateActionBody {
                    capability: CapabilityType::Filesystem,
                    operation: "read".to_string(),
                    params: json!({}),
                    reasoning: None,
                },
            )
            .expect_err("missing path");
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(h.orchestrator.store().list_requests(None).len(), before);
    }

    #[test]
    fn cross_agent_access_is_denied() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");
        let request = read_request(&h, &file.display().to_string());

        let (other, _key) = h.orchestrator.create_agent(1, "other-agent").expect("agent");
        let err = h
            .orchestrator
            .dry_run(other.id, request.id)
            .expect_err("not the owner");
        assert_eq!(err.code(), "AUTHORIZATION");
    }

    #[tokio::test]
    async fn safe_mode_blocks_shell_rm_but_not_ls() {
        let h = harness();
        h.orchestrator.set_safe_mode(1, true).expect("safe mode on");

        let ls = h
            .orchestrator
            .create_request(
                h.agent.id,
                CreateActionBody {
                    capability: CapabilityType::Shell,
                    operation: "run".to_string(),
                    params: json!({"command": "ls", "cwd": h.sandbox.display().to_string()}),
                    reasoning: None,
                },
            )
            .expect("ls request");
        let ls_outcome = h.orchestrator.dry_run(h.agent.id, ls.id).expect("ls dry run");
        assert!(!ls_outcome.steps[0]
            .risk_flags
            .iter()
            .any(|f| f == crate::risk::flags::BLOCKED_BY_SAFE_MODE));

        let rm = h
            .orchestrator
            .create_request(
                h.agent.id,
                CreateActionBody {
                    capability: CapabilityType::Shell,
                    operation: "run".to_string(),
                    params: json!({"command": "rm", "args": ["-rf", "."], "cwd": h.sandbox.display().to_string()}),
                    reasoning: None,
                },
            )
            .expect("rm request");
        let rm_outcome = h.orchestrator.dry_run(h.agent.id, rm.id).expect("rm dry run");
        assert!(rm_outcome.steps[0]
            .risk_flags
            .iter()
            .any(|f| f == crate::risk::flags::BLOCKED_BY_SAFE_MODE));
        assert!(rm_outcome.steps[0]
            .risk_flags
            .iter()
            .any(|f| f == crate::risk::flags::RM));

        h.orchestrator
            .approve_plan(1, rm_outcome.plan.id, Decision::Approved)
            .expect("approve");
        let receipt = h
            .orchestrator
            .execute_plan(h.agent.id, rm_outcome.plan.id)
            .await
            .expect("receipt");
        assert_eq!(receipt.status, ReceiptStatus::Failure);
        assert_eq!(receipt.logs[0].status, crate::proto::StepStatus::Blocked);
    }

    #[test]
    fn lockdown_rotates_every_key_and_audits_once() {
        let h = harness();
        let (second, _key) = h.orchestrator.create_agent(1, "second-agent").expect("agent");
        let before: Vec<String> = h
            .orchestrator
            .store()
            .list_agents()
            .into_iter()
            .map(|a| a.api_key_hash)
            .collect();

        let affected = h.orchestrator.emergency_lockdown(1).expect("lockdown");
        assert_eq!(affected, 2);
        assert!(h.orchestrator.safe_mode());

        let after: Vec<String> = h
            .orchestrator
            .store()
            .list_agents()
            .into_iter()
            .map(|a| a.api_key_hash)
            .collect();
        for (old, new) in before.iter().zip(after.iter()) {
            assert_ne!(old, new);
        }
        let _ = second;

        let lockdown_events: Vec<_> = h
            .orchestrator
            .audit()
            .events()
            .into_iter()
            .filter(|e| e.event_type == "EMERGENCY_LOCKDOWN")
            .collect();
        assert_eq!(lockdown_events.len(), 1);
        assert_eq!(lockdown_events[0].data["data"]["severity"], json!("critical"));
        assert_eq!(lockdown_events[0].data["data"]["agentsAffected"], json!(2));
        h.orchestrator.audit().verify_chain().expect("chain verifies");
    }

    #[test]
    fn every_transition_audits_exactly_once() {
        let h = harness();
        let file = h.sandbox.join("x.txt");
        std::fs::write(&file, "hello").expect("seed");

        let baseline = h.orchestrator.audit().events().len();
        let request = read_request(&h, &file.display().to_string());
        let outcome = h.orchestrator.dry_run(h.agent.id, request.id).expect("dry run");
        h.orchestrator
            .approve_plan(1, outcome.plan.id, Decision::Approved)
            .expect("approve");

        let events = h.orchestrator.audit().events();
        let new: Vec<&str> = events[baseline..]
            .iter()
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(new, vec!["REQUEST_CREATED", "DRY_RUN_COMPLETE", "PLAN_DECISION"]);
    }

    #[test]
    fn rate_limit_surfaces_as_rate_limit_error() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("db.json")).expect("store"));
        let audit = Arc::new(AuditLog::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store,
            Arc::new(EffectorRegistry::builtin()),
            audit,
            Arc::new(PolicyEngine::from_config(PolicyConfig {
                max_requests_per_minute: 1,
            })),
        );
        let (agent, _key) = orchestrator.create_agent(1, "limited").expect("agent");
        orchestrator
            .update_capability(1, agent.id, CapabilityType::Echo, true, None)
            .expect("echo capability");

        let body = || CreateActionBody {
            capability: CapabilityType::Echo,
            operation: "say".to_string(),
            params: json!({"message": "hi"}),
            reasoning: None,
        };
        orchestrator.create_request(agent.id, body()).expect("first");
        let err = orchestrator
            .create_request(agent.id, body())
            .expect_err("second");
        assert_eq!(err.code(), "RATE_LIMIT");
    }
}
