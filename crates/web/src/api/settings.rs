//! Operator settings: the scheduler's refresh interval.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use shelfsync_core::scheduler::RefreshInterval;

use super::AppError;
use crate::AppState;

#[derive(Serialize)]
struct IntervalResponse {
    interval: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/settings/refresh-interval",
        get(get_refresh_interval).put(put_refresh_interval),
    )
}

async fn get_refresh_interval(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IntervalResponse>, AppError> {
    let interval = state.scheduler.get_interval().await?;
    Ok(Json(IntervalResponse {
        interval: interval.to_string(),
    }))
}

/// Body: `{"interval": "30m"}`. The value is validated before it reaches
/// the scheduler so non-string JSON gets a precise error.
async fn put_refresh_interval(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<IntervalResponse>, AppError> {
    let raw = body.get("interval").unwrap_or(&serde_json::Value::Null);
    let interval =
        RefreshInterval::from_json(raw).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let applied = state.scheduler.set_interval(interval.as_str()).await?;
    info!(interval = %applied, "refresh interval updated via API");
    Ok(Json(IntervalResponse {
        interval: applied.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::test_support::{send, test_app};

    const URI: &str = "/api/settings/refresh-interval";

    #[tokio::test]
    async fn test_get_default_interval() {
        let app = test_app();
        let (status, body) = send(&app.router, "GET", URI, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval"], "disabled");
    }

    #[tokio::test]
    async fn test_put_valid_interval() {
        let app = test_app();
        let (status, body) = send(&app.router, "PUT", URI, Some(json!({"interval": "15M"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval"], "15M");

        let (_, body) = send(&app.router, "GET", URI, None).await;
        assert_eq!(body["interval"], "15M");
    }

    #[tokio::test]
    async fn test_put_invalid_intervals() {
        let app = test_app();
        for (value, fragment) in [
            (json!("0m"), "positive"),
            (json!("5s"), "unknown unit"),
            (json!(""), "empty"),
            (json!(30), "must be a string"),
            (json!("often"), "expected"),
        ] {
            let (status, body) =
                send(&app.router, "PUT", URI, Some(json!({ "interval": value }))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{value}");
            let message = body["error"].as_str().unwrap();
            assert!(message.contains(fragment), "{value}: {message}");
        }

        let (status, _) = send(&app.router, "PUT", URI, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(&app.router, "GET", URI, None).await;
        assert_eq!(body["interval"], "disabled");
    }

    #[tokio::test]
    async fn test_put_disabled_turns_refresh_off() {
        let app = test_app();
        send(&app.router, "PUT", URI, Some(json!({"interval": "2h"}))).await;
        let (status, body) =
            send(&app.router, "PUT", URI, Some(json!({"interval": "disabled"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval"], "disabled");

        let interval = app.state.scheduler.get_interval().await.unwrap();
        assert!(interval.is_disabled());
    }
}
