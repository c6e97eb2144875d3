use std::sync::Arc;

use anyhow::Context;

use modgate_auth::Session;
use modgate_core::UserId;
use modgate_engine::{EngineConfig, HttpModuleStatusSource, HttpPermissionSource, ModuleGate};
use modgate_registry::{ModuleRegistry, catalog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    modgate_observability::init();

    let config = EngineConfig::from_env();
    let registry = load_registry(&config)?;

    let client = reqwest::Client::new();
    let gate = ModuleGate::builder(registry)
        .permission_source(Arc::new(HttpPermissionSource::new(client.clone(), &config.api_base_url)))
        .status_source(Arc::new(HttpModuleStatusSource::new(client, &config.api_base_url)))
        .unauthorized_handler(Arc::new(|| tracing::warn!("backend rejected the session token")))
        .config(config.clone())
        .build();

    gate.refresh_registry().await?;
    if let Some(session) = session_from_env()? {
        gate.set_session(Some(session)).await?;
    }
    gate.reconcile_now().await?;

    let enabled: Vec<String> = gate.enabled_modules().iter().map(|m| m.id.to_string()).collect();
    let report = serde_json::json!({
        "registry_version": gate.registry().version(),
        "authenticated": gate.is_authenticated(),
        "permissions": gate.permissions(),
        "enabled_modules": enabled,
        "routes": gate.enabled_routes(),
        "menu": gate.enabled_menu_items(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    gate.shutdown().await;
    Ok(())
}

fn load_registry(config: &EngineConfig) -> anyhow::Result<ModuleRegistry> {
    match &config.registry_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read registry file {path}"))?;
            ModuleRegistry::from_json(&json).with_context(|| format!("invalid registry file {path}"))
        }
        None => Ok(catalog::default_registry()?),
    }
}

fn session_from_env() -> anyhow::Result<Option<Session>> {
    let (Ok(user), Ok(token)) = (std::env::var("MODGATE_USER_ID"), std::env::var("MODGATE_TOKEN")) else {
        tracing::info!("no session configured, resolving anonymously");
        return Ok(None);
    };
    let user_id: UserId = user.parse().context("MODGATE_USER_ID must be a UUID")?;
    Ok(Some(Session::new(user_id, token)))
}
