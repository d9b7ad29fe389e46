//! Status and health check endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use shelfsync_core::models::{HistoryEntry, ProviderStatus};

use super::AppError;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

/// One registered provider and its current status.
#[derive(Serialize)]
struct ProviderEntry {
    name: String,
    configured: bool,
    status: ProviderStatus,
}

#[derive(Serialize)]
struct SyncStatusResponse {
    syncing: bool,
    refresh_interval: Option<String>,
    providers: Vec<ProviderEntry>,
    history: Vec<HistoryEntry>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/status/health", get(health_check))
        .route("/api/sync/status", get(get_all_status))
        .route("/api/sync/status/:provider", get(get_provider_status))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// A provider that never started a pass reports as idle.
fn status_or_idle(name: &str, status: Option<ProviderStatus>) -> ProviderStatus {
    status.unwrap_or_else(|| ProviderStatus {
        provider: name.to_string(),
        ..Default::default()
    })
}

async fn get_all_status(State(state): State<Arc<AppState>>) -> Json<SyncStatusResponse> {
    let registry = state.engine.status();
    let known = registry.get_all().await;

    let providers = state
        .engine
        .providers()
        .all()
        .iter()
        .map(|p| {
            let name = p.provider_name();
            let status = known.iter().find(|s| s.provider == name).cloned();
            ProviderEntry {
                name: name.to_string(),
                configured: p.is_configured(),
                status: status_or_idle(name, status),
            }
        })
        .collect();

    Json(SyncStatusResponse {
        syncing: registry.any_syncing().await,
        refresh_interval: state
            .scheduler
            .get_interval()
            .await
            .ok()
            .map(|i| i.to_string()),
        providers,
        history: registry.history().await,
    })
}

async fn get_provider_status(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ProviderStatus>, AppError> {
    if state.engine.providers().get(&provider).is_none() {
        return Err(AppError::NotFound(format!("unknown provider '{provider}'")));
    }
    let status = state.engine.status().get_status(&provider).await;
    Ok(Json(status_or_idle(&provider, status)))
}
