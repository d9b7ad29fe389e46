//! Live status feed over WebSocket.
//!
//! `GET /ws` streams every status registry envelope (`started`, `progress`,
//! `completed`, `failed`) as a JSON text frame. `GET /ws?provider=calibre`
//! only forwards that provider's events.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use shelfsync_core::notify::Envelope;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    provider: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so no event between the two is lost.
    let rx = state.channel.subscribe();
    ws.on_upgrade(move |socket| feed(socket, rx, query.provider))
}

/// Whether a serialized envelope should reach a client filtering on
/// `provider`. Frames that don't parse are passed through.
fn wanted(frame: &str, provider: Option<&str>) -> bool {
    let Some(provider) = provider else {
        return true;
    };
    match serde_json::from_str::<Envelope>(frame) {
        Ok(envelope) => envelope.payload["provider"] == provider,
        Err(_) => true,
    }
}

fn notice(kind: &str, message: String) -> Message {
    Message::Text(serde_json::json!({ "type": kind, "message": message }).to_string())
}

async fn feed(mut socket: WebSocket, mut rx: broadcast::Receiver<String>, provider: Option<String>) {
    debug!(provider = ?provider, "status feed client connected");

    let hello = match provider {
        Some(ref name) => format!("shelfsync live updates for {name}"),
        None => "shelfsync live updates".to_string(),
    };
    if let Err(e) = socket.send(notice("connected", hello)).await {
        warn!("failed to greet status feed client: {}", e);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let outgoing = match event {
                    Ok(frame) if wanted(&frame, provider.as_deref()) => Message::Text(frame),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status feed client lagging");
                        notice("warning", format!("lagged by {skipped} messages"))
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = socket.send(outgoing).await {
                    debug!("status feed send failed: {}", e);
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("status feed client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{send, test_app};

    fn frame(provider: &str) -> String {
        serde_json::to_string(&Envelope {
            topic: "sync:status".into(),
            payload: serde_json::json!({"event": "started", "provider": provider}),
        })
        .unwrap()
    }

    #[test]
    fn test_filter_by_provider() {
        assert!(wanted(&frame("calibre"), None));
        assert!(wanted(&frame("calibre"), Some("calibre")));
        assert!(!wanted(&frame("audiobookshelf"), Some("calibre")));
        assert!(wanted("not json", Some("calibre")));
    }

    #[tokio::test]
    async fn test_plain_get_is_rejected() {
        let app = test_app();
        let (status, body) = send(&app.router, "GET", "/ws", None).await;
        assert!(status.is_client_error(), "{status}");
        // axum answers a missing upgrade with a plain-text rejection.
        assert!(body.is_string(), "{body}");
    }
}
