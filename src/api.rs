use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{find_agent_by_key, verify_password, SessionManager, SESSION_COOKIE};
use crate::error::ApiError;
use crate::ledger::AuditLog;
use crate::orchestrator::Orchestrator;
use crate::proto::{
    AdminUser, AdminView, Agent, AgentView, AgentWithCapabilities, ApprovePlanRequest,
    AuditListResponse, CapabilityType, CreateActionBody, CreateActionResponse, CreateAgentRequest,
    CreateAgentResponse, DryRunResponse, LockdownResponse, LoginRequest, RequestDetail,
    RequestStatus, RotateKeyResponse, SafeModeBody, UpdateCapabilityRequest, UpsertSettingRequest,
};
use crate::store::Store;

pub struct AppState {
    pub store: Arc<Store>,
    pub orchestrator: Orchestrator,
    pub sessions: SessionManager,
    pub audit: Arc<AuditLog>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/admin/login", post(admin_login))
        .route("/api/admin/logout", post(admin_logout))
        .route("/api/admin/me", get(admin_me))
        .route("/api/admin/agents", get(list_agents).post(create_agent))
        .route("/api/admin/agents/{id}/rotate-key", post(rotate_key))
        .route(
            "/api/admin/agents/{id}/capabilities/{type}",
            patch(update_capability),
        )
        .route("/api/admin/settings", get(list_settings))
        .route("/api/admin/settings/{key}", get(get_setting).put(put_setting))
        .route("/api/admin/action-requests", get(list_action_requests))
        .route("/api/admin/action-requests/{id}", get(action_request_detail))
        .route("/api/admin/plans/{id}/approve", post(approve_plan))
        .route("/api/admin/safe-mode", get(get_safe_mode).post(set_safe_mode))
        .route("/api/admin/lockdown", post(lockdown))
        .route("/api/admin/audit", get(audit_events))
        .route("/api/agent/action-requests", post(agent_create_action))
        .route(
            "/api/agent/action-requests/{id}/dry-run",
            post(agent_dry_run),
        )
        .route("/api/agent/plans/{id}/execute", post(agent_execute))
        .with_state(state)
}

// Auth plumbing.

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AdminUser, ApiError> {
    let cookie = session_cookie(headers)
        .ok_or_else(|| ApiError::authentication("admin session required"))?;
    let admin_id = state
        .sessions
        .resolve(&cookie)
        .ok_or_else(|| ApiError::authentication("session expired or invalid"))?;
    state
        .store
        .get_admin(admin_id)
        .ok_or_else(|| ApiError::authentication("session user no longer exists"))
}

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(key) = value.strip_prefix("Bearer ") {
            return Some(key.trim().to_string());
        }
    }
    // Legacy header kept for older SDK clients.
    headers
        .get("x-agent-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn require_agent(state: &AppState, headers: &HeaderMap) -> Result<Agent, ApiError> {
    let key =
        bearer_key(headers).ok_or_else(|| ApiError::authentication("agent API key required"))?;
    let agent = find_agent_by_key(&state.store, &key)
        .ok_or_else(|| ApiError::authentication("unknown agent API key"))?;
    state
        .store
        .touch_agent(agent.id)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(agent)
}

// Admin handlers.

async fn admin_login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = state
        .store
        .admin_by_username(&body.username)
        .ok_or_else(|| ApiError::authentication("invalid credentials"))?;
    if !verify_password(&body.password, &admin.password_hash) {
        return Err(ApiError::authentication("invalid credentials"));
    }

    let cookie = state.sessions.create(admin.id);
    state
        .audit
        .append("ADMIN_LOGIN", json!({ "username": admin.username }))
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok((
        AppendHeaders([(
            SET_COOKIE,
            format!("{SESSION_COOKIE}={cookie}; Path=/; HttpOnly; SameSite=Lax"),
        )]),
        Json(AdminView {
            id: admin.id,
            username: admin.username,
        }),
    ))
}

async fn admin_logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(cookie) = session_cookie(&headers) {
        state.sessions.destroy(&cookie);
    }
    Ok((
        AppendHeaders([(
            SET_COOKIE,
            format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0"),
        )]),
        Json(json!({ "ok": true })),
    ))
}

async fn admin_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AdminView>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    Ok(Json(AdminView {
        id: admin.id,
        username: admin.username,
    }))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentWithCapabilities>>, ApiError> {
    require_admin(&state, &headers)?;
    let agents = state
        .store
        .list_agents()
        .iter()
        .map(|agent| AgentWithCapabilities {
            agent: AgentView::from(agent),
            capabilities: state.store.capabilities_for(agent.id),
        })
        .collect();
    Ok(Json(agents))
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentRequest>,
) -> Result<Json<CreateAgentResponse>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let (agent, api_key) = state.orchestrator.create_agent(admin.id, &body.name)?;
    Ok(Json(CreateAgentResponse {
        agent: AgentView::from(&agent),
        api_key,
    }))
}

async fn rotate_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<i64>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let api_key = state.orchestrator.rotate_agent_key(admin.id, agent_id)?;
    Ok(Json(RotateKeyResponse { api_key }))
}

async fn update_capability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((agent_id, capability)): Path<(i64, String)>,
    Json(body): Json<UpdateCapabilityRequest>,
) -> Result<Json<crate::proto::AgentCapability>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let capability = CapabilityType::parse(&capability)
        .ok_or_else(|| ApiError::validation(format!("unknown capability type: {capability}")))?;
    let record = state.orchestrator.update_capability(
        admin.id,
        agent_id,
        capability,
        body.enabled,
        body.config,
    )?;
    Ok(Json(record))
}

async fn list_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::proto::Setting>>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.store.list_settings()))
}

async fn get_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<crate::proto::Setting>, ApiError> {
    require_admin(&state, &headers)?;
    let value = state
        .store
        .get_setting(&key)
        .ok_or_else(|| ApiError::not_found(format!("setting {key}")))?;
    Ok(Json(crate::proto::Setting { key, value }))
}

async fn put_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<UpsertSettingRequest>,
) -> Result<Json<crate::proto::Setting>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let setting = state.orchestrator.update_setting(admin.id, &key, body.value)?;
    Ok(Json(setting))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn list_action_requests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<crate::proto::ActionRequest>>, ApiError> {
    require_admin(&state, &headers)?;
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            RequestStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    Ok(Json(state.store.list_requests(status)))
}

async fn action_request_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(request_id): Path<i64>,
) -> Result<Json<RequestDetail>, ApiError> {
    require_admin(&state, &headers)?;
    let request = state
        .store
        .get_request(request_id)
        .ok_or_else(|| ApiError::not_found(format!("action request {request_id}")))?;
    Ok(Json(RequestDetail {
        plans: state.store.plans_for_request(request.id),
        request,
    }))
}

async fn approve_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    Json(body): Json<ApprovePlanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let (approval, request) = state
        .orchestrator
        .approve_plan(admin.id, plan_id, body.decision)?;
    Ok(Json(json!({ "approval": approval, "request": request })))
}

async fn get_safe_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SafeModeBody>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(SafeModeBody {
        enabled: state.orchestrator.safe_mode(),
    }))
}

async fn set_safe_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SafeModeBody>,
) -> Result<Json<SafeModeBody>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.orchestrator.set_safe_mode(admin.id, body.enabled)?;
    Ok(Json(SafeModeBody {
        enabled: body.enabled,
    }))
}

async fn lockdown(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<LockdownResponse>, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let agents_affected = state.orchestrator.emergency_lockdown(admin.id)?;
    Ok(Json(LockdownResponse {
        safe_mode: true,
        agents_affected,
    }))
}

async fn audit_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AuditListResponse>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(AuditListResponse {
        events: state.audit.events(),
        chain_valid: state.audit.verify_chain().is_ok(),
    }))
}

// Agent handlers.

async fn agent_create_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateActionBody>,
) -> Result<Json<CreateActionResponse>, ApiError> {
    let agent = require_agent(&state, &headers)?;
    let request = state.orchestrator.create_request(agent.id, body)?;
    Ok(Json(CreateActionResponse {
        request_id: request.id,
        status: request.status,
    }))
}

async fn agent_dry_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(request_id): Path<i64>,
) -> Result<Json<DryRunResponse>, ApiError> {
    let agent = require_agent(&state, &headers)?;
    let outcome = state.orchestrator.dry_run(agent.id, request_id)?;
    Ok(Json(DryRunResponse {
        plan_id: outcome.plan.id,
        steps: outcome.steps,
        risk_score: outcome.risk_summary.total_risk_score,
        risk_summary: outcome.risk_summary,
    }))
}

async fn agent_execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<Json<crate::proto::ExecutionReceipt>, ApiError> {
    let agent = require_agent(&state, &headers)?;
    let receipt = state.orchestrator.execute_plan(agent.id, plan_id).await?;
    Ok(Json(receipt))
}
