// state.rs - Process-wide dispatcher state, threaded explicitly instead of
// living behind module globals (see DESIGN.md: "cross-worker callbacks").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Closed state machine driven by worker progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Init,
    LoadingModel,
    Online,
    Rendering,
    Unavailable,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Init => "init",
            ServerState::LoadingModel => "loading_model",
            ServerState::Online => "online",
            ServerState::Rendering => "rendering",
            ServerState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// A non-cancellation, terminal failure recorded against the whole process
/// (e.g. the last worker died). Cancellation never lives here; it's a
/// per-task sentinel (see `task::CancelSentinel`).
#[derive(Debug, Clone)]
pub struct StateError(pub String);

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The model (and optional VAE) currently loaded by the render runtime.
/// Mirrors the source's `current_model_path` / `current_vae_path` globals
/// (`task_manager.py`), shared the same way as the rest of this struct:
/// explicitly, through an `Arc`, never as a `static`.
#[derive(Debug, Clone, Default)]
pub struct LoadedModel {
    pub model: Option<String>,
    pub vae: Option<String>,
}

/// Shared, explicitly-passed state every worker and the HTTP surface read
/// from. Replaces the source's module-level `current_state` / `state_error`.
pub struct DispatcherState {
    state: RwLock<ServerState>,
    error: RwLock<Option<StateError>>,
    loaded_model: RwLock<LoadedModel>,
    shutdown: AtomicBool,
}

impl DispatcherState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ServerState::Init),
            error: RwLock::new(None),
            loaded_model: RwLock::new(LoadedModel::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub async fn get(&self) -> ServerState {
        *self.state.read().await
    }

    pub async fn set(&self, next: ServerState) {
        *self.state.write().await = next;
    }

    pub async fn error(&self) -> Option<StateError> {
        self.error.read().await.clone()
    }

    pub async fn set_error(&self, err: Option<StateError>) {
        *self.error.write().await = err;
    }

    pub async fn loaded_model(&self) -> LoadedModel {
        self.loaded_model.read().await.clone()
    }

    pub async fn set_loaded_model(&self, model: String, vae: Option<String>) {
        *self.loaded_model.write().await = LoadedModel { model: Some(model), vae };
    }

    /// Broadcasts shutdown; workers observe this at the next poll boundary.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
