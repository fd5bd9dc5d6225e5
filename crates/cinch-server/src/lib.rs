//! HTTP/WebSocket control plane for Cinch: webhooks, the session
//! endpoint, and the admin API (`spec.md` §4, §6).
//!
//! Grounded on `buildit-api`'s `lib.rs`/`state.rs`/`routes/mod.rs` shape:
//! an `AppState` built once in `main.rs`, handed to a `Router` assembled
//! from per-concern submodules.

pub mod descriptor;
pub mod error;
pub mod forge;
pub mod hooks;
pub mod jobfactory;
pub mod logfanout;
pub mod normalize;
mod routes;
pub mod session;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cinch_core::storage::Storage;
use cinch_dispatcher::{Dispatcher, TerminalHook};
use cinch_hub::{AccessCache, Hub};

use descriptor::ServerDescriptorFactory;
use forge::GithubForge;
use hooks::ServerTerminalHook;
use logfanout::LogFanout;
use session::ws_handler;
use state::{AppState, ForgeRegistry};

/// Assemble the forges, Hub, Dispatcher, and `AppState` a binary needs
/// to serve the router returned by [`router`].
pub async fn build_state(
    storage: Arc<dyn Storage>,
    public_base_url: String,
    admin_tokens: HashMap<String, String>,
    github_api_base: Option<String>,
) -> AppState {
    let mut github = GithubForge::new();
    if let Some(base) = github_api_base {
        github = github.with_api_base(base);
    }
    let forges = ForgeRegistry::default().with_github(Arc::new(github));

    let hub = Arc::new(Hub::new());
    let access_cache = Arc::new(AccessCache::default());
    let log_fanout = Arc::new(LogFanout::new());
    let terminal_hook: Arc<dyn TerminalHook> = Arc::new(ServerTerminalHook::new(
        storage.clone(),
        forges.clone(),
        public_base_url,
    ));
    let descriptors = Arc::new(ServerDescriptorFactory::new(forges.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        hub.clone(),
        descriptors,
        terminal_hook.clone(),
    ));
    let dispatch_tx = dispatcher.clone().spawn();

    AppState {
        storage,
        hub,
        dispatcher,
        dispatch_tx,
        access_cache,
        forges,
        log_fanout,
        terminal_hook,
        admin_tokens: Arc::new(admin_tokens),
    }
}

/// Build the full Axum router: webhooks, the executor session endpoint,
/// the admin surface, and health checks (`buildit-api/src/routes/mod.rs`
/// composition pattern, generalized to Cinch's own route set).
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/webhooks", routes::webhooks::router())
        .nest("/admin", routes::admin::router())
        .merge(routes::health::router())
        .route("/session", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Periodically evict sessions that haven't heartbeat within the
/// timeout (`spec.md` §4.5). Grounded on the Dispatcher's own
/// `tokio::spawn` + `mpsc`-driven loop shape.
pub fn spawn_dead_session_reaper(hub: Arc<Hub>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (worker_id, generation) in hub.dead_sessions(chrono::Duration::seconds(90)).await {
                tracing::warn!(%worker_id, generation, "reaping dead executor session");
                hub.unregister(worker_id, generation).await;
            }
        }
    });
}
