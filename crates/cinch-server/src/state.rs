//! Shared application state, grounded on `buildit-api/src/state.rs`'s
//! `AppState` (repos + broadcaster behind `Arc`, cloned into handlers).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use cinch_core::repository::ForgeKind;
use cinch_core::storage::Storage;
use cinch_dispatcher::{DispatchEvent, Dispatcher, TerminalHook};
use cinch_hub::{AccessCache, Hub};

use crate::forge::GithubForge;
use crate::logfanout::LogFanout;

/// Registry of configured forge adapters, dispatched by `ForgeKind`
/// (`spec.md` §9 Design Notes: "capability tag plus a dispatch table",
/// not runtime reflection).
#[derive(Clone, Default)]
pub struct ForgeRegistry {
    github: Option<Arc<GithubForge>>,
}

impl ForgeRegistry {
    pub fn with_github(mut self, github: Arc<GithubForge>) -> Self {
        self.github = Some(github);
        self
    }

    pub fn get(&self, kind: ForgeKind) -> Option<Arc<GithubForge>> {
        match kind {
            ForgeKind::Github => self.github.clone(),
            _ => {
                warn!(?kind, "no forge adapter configured for this kind");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub hub: Arc<Hub>,
    pub dispatcher: Arc<Dispatcher>,
    pub dispatch_tx: mpsc::Sender<DispatchEvent>,
    pub access_cache: Arc<AccessCache>,
    pub forges: ForgeRegistry,
    pub log_fanout: Arc<LogFanout>,
    /// Shared with the Dispatcher so every terminal transition — queue
    /// timeout or session `JOB_COMPLETE`/`JOB_ERROR` — posts through
    /// the same code path (`spec.md` §6.5).
    pub terminal_hook: Arc<dyn TerminalHook>,
    /// Bearer tokens accepted at the session endpoint are looked up
    /// through `Storage`; this holds only the webhook-facing admin
    /// bootstrap token used by the `routes::admin` surface.
    pub admin_tokens: Arc<HashMap<String, String>>,
}
