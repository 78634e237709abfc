//! Shared application state and the preview-session registry.

use crate::autosave::{EventSink, AUTOSAVE_INTERVAL};
use crate::proxy::ApiProxy;
use crate::sandbox::SharedSandbox;
use crate::session::{SandboxSession, SessionCommands};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Idle preview sessions are reaped after this many seconds (30 minutes).
pub const SESSION_TTL_SECS: u64 = 1800;

/// A hosted preview: the session plus the task driving it.
pub struct PreviewSession {
    pub id: String,
    pub session: Arc<SandboxSession>,
    pub task: JoinHandle<()>,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        // Dropping the driver kills the spawned processes.
        self.task.abort();
    }
}

/// Thread-safe session storage.
pub type Sessions = Arc<RwLock<HashMap<String, PreviewSession>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Sessions,
    pub sandbox: Arc<SharedSandbox>,
    pub proxy: Arc<ApiProxy>,
    pub commands: SessionCommands,
    pub terminal_cap: usize,
    /// Backend event channel for the autosave relay; `None` disables it.
    pub autosave: Option<Arc<dyn EventSink>>,
    pub autosave_interval: Duration,
}

impl AppState {
    pub fn new(
        sandbox: Arc<SharedSandbox>,
        proxy: Arc<ApiProxy>,
        commands: SessionCommands,
        terminal_cap: usize,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sandbox,
            proxy,
            commands,
            terminal_cap,
            autosave: None,
            autosave_interval: AUTOSAVE_INTERVAL,
        }
    }

    pub fn with_autosave(mut self, sink: Arc<dyn EventSink>, interval: Duration) -> Self {
        self.autosave = Some(sink);
        self.autosave_interval = interval;
        self
    }
}
