use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::serve;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::api::{build_router, AppState};
use warden::auth::{seed_admin, SessionManager};
use warden::config::ServerConfig;
use warden::effectors::{resolve_absolute, EffectorRegistry};
use warden::ledger::AuditLog;
use warden::orchestrator::Orchestrator;
use warden::policy::PolicyEngine;
use warden::proto::settings;
use warden::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
        )
        .init();

    let config = ServerConfig::from_env();

    fs::create_dir_all(&config.sandbox_path)?;
    let sandbox_root = resolve_absolute(&config.sandbox_path.display().to_string());

    let store = Arc::new(Store::open(&config.database_path)?);
    seed_admin(&store, config.admin_password.clone())?;
    seed_default_settings(&store, &sandbox_root.display().to_string())?;

    let registry = Arc::new(EffectorRegistry::builtin());
    let audit = Arc::new(AuditLog::new(store.clone()));
    let policy = Arc::new(PolicyEngine::from_file_or_default(&config.policy_path)?);

    let orchestrator = Orchestrator::new(store.clone(), registry, audit.clone(), policy);
    let state = Arc::new(AppState {
        store,
        orchestrator,
        sessions: SessionManager::new(config.session_secret.clone()),
        audit,
    });
    let app = build_router(state);

    let addr: SocketAddr = ([127, 0, 0, 1], config.port).into();
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, sandbox = %sandbox_root.display(), "warden listening");
    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn seed_default_settings(store: &Store, sandbox_root: &str) -> Result<(), warden::store::StoreError> {
    if store.get_setting(settings::ALLOWED_ROOTS).is_none() {
        store.put_setting(settings::ALLOWED_ROOTS, serde_json::json!([sandbox_root]))?;
    }
    if store.get_setting(settings::SHELL_ALLOWLIST).is_none() {
        store.put_setting(
            settings::SHELL_ALLOWLIST,
            serde_json::json!(["^(ls|cat|head|tail|echo|pwd|whoami|date)( .*)?$"]),
        )?;
    }
    if store.get_setting(settings::SAFE_MODE).is_none() {
        store.put_setting(settings::SAFE_MODE, serde_json::json!(false))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
