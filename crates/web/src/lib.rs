//! shelfsync web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Health and per-provider sync status endpoints
//! - Manual sync triggers (all providers or one)
//! - Refresh interval settings
//! - WebSocket endpoint forwarding status notifications

pub mod api;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use shelfsync_core::notify::BroadcastChannel;
use shelfsync_core::scheduler::Scheduler;
use shelfsync_core::sync_engine::SyncEngine;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: SyncEngine,
    pub scheduler: Scheduler,
    /// Channel the status registry publishes to; websocket clients subscribe.
    pub channel: BroadcastChannel,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(engine: SyncEngine, scheduler: Scheduler, channel: BroadcastChannel) -> Self {
        Self {
            state: Arc::new(AppState {
                engine,
                scheduler,
                channel,
            }),
        }
    }

    /// The full application router, without binding a socket.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Start the web server, listening on the given address.
    pub async fn start(self, listen_addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(api::status::routes())
        .merge(api::sync::routes())
        .merge(api::settings::routes())
        .merge(ws::routes())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use shelfsync_core::errors::ProviderError;
    use shelfsync_core::models::BookSyncRecord;
    use shelfsync_core::notify::BroadcastChannel;
    use shelfsync_core::providers::{LibraryProvider, ProviderRegistry};
    use shelfsync_core::scheduler::Scheduler;
    use shelfsync_core::status::SyncStatusRegistry;
    use shelfsync_core::sync_engine::SyncEngine;
    use shelfsync_core::Database;

    use super::{build_router, AppState};

    /// Provider whose pass blocks until the gate gets a permit.
    pub struct GatedProvider {
        pub name: &'static str,
        pub configured: bool,
        pub gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl LibraryProvider for GatedProvider {
        fn provider_name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn fetch_all(&self) -> Result<Vec<BookSyncRecord>, ProviderError> {
            let _permit = self.gate.acquire().await.expect("gate open");
            Ok(vec![BookSyncRecord::new(Some("Dune"), Some("Frank Herbert"))])
        }
    }

    pub struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        pub gate: Arc<Semaphore>,
    }

    /// App with a configured `library` provider and an unconfigured
    /// `offline` one, both gated on the same semaphore.
    pub fn test_app() -> TestApp {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);

        let gate = Arc::new(Semaphore::new(0));
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(GatedProvider {
            name: "library",
            configured: true,
            gate: gate.clone(),
        }));
        providers.register(Arc::new(GatedProvider {
            name: "offline",
            configured: false,
            gate: gate.clone(),
        }));

        let channel = BroadcastChannel::new();
        let status = SyncStatusRegistry::spawn(Arc::new(channel.clone()));
        let engine = SyncEngine::new(providers, db.clone(), status);
        let scheduler = Scheduler::spawn(Arc::new(engine.clone()), db, "disabled");

        let state = Arc::new(AppState {
            engine,
            scheduler,
            channel,
        });
        TestApp {
            router: build_router(state.clone()),
            state,
            gate,
        }
    }

    pub async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }
}
