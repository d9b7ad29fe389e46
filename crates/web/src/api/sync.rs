//! Manual sync triggers.
//!
//! Triggers return as soon as the pass is accepted (202). Progress and the
//! outcome are observable via `/api/sync/status` and the `/ws` feed.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use shelfsync_core::sync_engine::TriggerReport;

use super::AppError;
use crate::AppState;

#[derive(Serialize)]
struct TriggerResponse {
    provider: String,
    status: &'static str,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync", post(trigger_all))
        .route("/api/sync/:provider", post(trigger_provider))
}

async fn trigger_all(State(state): State<Arc<AppState>>) -> (StatusCode, Json<TriggerReport>) {
    info!("manual sync requested for all providers");
    let report = state.engine.trigger_all().await;
    (StatusCode::ACCEPTED, Json(report))
}

async fn trigger_provider(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    info!(provider = %provider, "manual sync requested");
    state.engine.trigger(&provider).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            provider,
            status: "accepted",
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use crate::test_support::{send, test_app};

    #[tokio::test]
    async fn test_trigger_provider_then_conflict() {
        let app = test_app();

        let (status, body) = send(&app.router, "POST", "/api/sync/library", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");

        let (status, body) = send(&app.router, "POST", "/api/sync/library", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already syncing"));

        app.gate.add_permits(1);
        for _ in 0..500 {
            if !app.state.engine.status().is_syncing("library").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (status, _) = send(&app.router, "POST", "/api/sync/library", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_trigger_unknown_and_unconfigured() {
        let app = test_app();

        let (status, _) = send(&app.router, "POST", "/api/sync/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app.router, "POST", "/api/sync/offline", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_trigger_all_reports_rejections() {
        let app = test_app();

        let (status, body) = send(&app.router, "POST", "/api/sync", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], serde_json::json!(["library"]));
        assert_eq!(body["rejected"], serde_json::json!([]));

        let (status, body) = send(&app.router, "POST", "/api/sync", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], serde_json::json!([]));
        assert_eq!(body["rejected"], serde_json::json!(["library"]));

        app.gate.add_permits(1);
    }
}
