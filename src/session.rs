//! Sandbox preview session lifecycle.
//!
//! A session walks Idle -> Booting -> Mounting -> Installing -> Running ->
//! Ready, landing in Failed with a reason if any step errors. Observers read
//! the current [`SessionState`] through a `watch` channel.

use crate::error::{Error, Result};
use crate::output::{stream_output, TerminalBuffer};
use crate::sandbox::{ServerReady, SharedSandbox, SpawnedProcess};
use crate::tree::{build_mount_payload, TreeNode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Booting,
    Mounting,
    Installing,
    Running,
    Ready,
    Failed { reason: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Failed { .. })
    }
}

/// Commands run after mounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCommands {
    pub install: String,
    pub run: String,
}

impl Default for SessionCommands {
    fn default() -> Self {
        Self {
            install: "npm install".to_string(),
            run: "npm run dev".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    /// Last URL reported by a server-ready signal; empty until the first.
    pub preview_url: String,
    pub terminal: TerminalBuffer,
    /// True until the run command has been issued.
    pub loading: bool,
}

/// Serializable view of a [`SessionState`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub preview_url: String,
    pub terminal_output: String,
    pub dropped_bytes: u64,
    pub loading: bool,
}

impl SessionState {
    fn new(terminal_cap: usize) -> Self {
        Self {
            phase: Phase::Idle,
            preview_url: String::new(),
            terminal: TerminalBuffer::with_cap(terminal_cap),
            loading: true,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase.clone(),
            preview_url: self.preview_url.clone(),
            terminal_output: self.terminal.as_str().to_string(),
            dropped_bytes: self.terminal.dropped(),
            loading: self.loading,
        }
    }
}

pub struct SandboxSession {
    id: String,
    sandbox: Arc<SharedSandbox>,
    commands: SessionCommands,
    state: watch::Sender<SessionState>,
}

impl SandboxSession {
    pub fn new(sandbox: Arc<SharedSandbox>, commands: SessionCommands, terminal_cap: usize) -> Self {
        let (state, _) = watch::channel(SessionState::new(terminal_cap));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sandbox,
            commands,
            state,
        }
    }

    /// Unique id, also the name of the session's sandbox workspace.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().snapshot()
    }

    /// Drive the session for `tree`. Returns once the run process exits or a
    /// step fails; while the preview server runs, this future stays pending.
    ///
    /// Only one start per session is accepted.
    pub async fn start(&self, tree: &TreeNode) -> Result<()> {
        let claimed = self.state.send_if_modified(|s| {
            if s.phase == Phase::Idle {
                s.phase = Phase::Booting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::AlreadyStarted);
        }

        let result = self.drive(tree).await;
        if let Err(e) = &result {
            warn!(error = %e, "Sandbox session failed");
            self.state.send_modify(|s| {
                s.phase = Phase::Failed {
                    reason: e.to_string(),
                };
                s.loading = false;
            });
        }
        result
    }

    async fn drive(&self, tree: &TreeNode) -> Result<()> {
        let sandbox = self.sandbox.acquire().await?;

        self.set_phase(Phase::Mounting);
        // Dropping the workspace removes its files.
        let workspace = sandbox.workspace(&self.id).await?;
        let payload = build_mount_payload(tree);
        workspace.mount(&payload).await?;

        self.set_phase(Phase::Installing);
        let install = workspace.spawn(&self.commands.install).await?;
        let code = self.pipe(install).await?;
        // Any exit proceeds to the run step.
        info!(exit_code = ?code, "Install finished");

        let ready_rx = workspace.server_ready();
        let run = workspace.spawn(&self.commands.run).await?;
        self.state.send_modify(|s| {
            s.phase = Phase::Running;
            s.loading = false;
        });
        info!(command = %self.commands.run, "Run command issued");

        self.watch_run(run, ready_rx).await
    }

    async fn pipe(&self, process: SpawnedProcess) -> Result<Option<i32>> {
        let (streamed, code) = tokio::join!(
            stream_output(process.output, |chunk| self.append(chunk)),
            process.exit
        );
        streamed?;
        code
    }

    async fn watch_run(
        &self,
        run: SpawnedProcess,
        mut ready_rx: broadcast::Receiver<ServerReady>,
    ) -> Result<()> {
        let SpawnedProcess { output, mut exit } = run;
        let pump = stream_output(output, |chunk| self.append(chunk));
        tokio::pin!(pump);
        let mut output_done = false;
        let mut ready_open = true;

        let code = loop {
            tokio::select! {
                streamed = &mut pump, if !output_done => {
                    output_done = true;
                    streamed?;
                }
                ready = ready_rx.recv(), if ready_open => match ready {
                    Ok(ready) => self.mark_ready(&ready),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed server-ready signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => ready_open = false,
                },
                code = &mut exit => break code?,
            }
        };
        if !output_done {
            pump.await?;
        }
        while let Ok(ready) = ready_rx.try_recv() {
            self.mark_ready(&ready);
        }

        info!(exit_code = ?code, "Run command exited");
        let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let exited_early = self.state.borrow().phase != Phase::Ready;
        if exited_early {
            return Err(Error::Sandbox(format!(
                "run command exited with code {} before a server was ready",
                code
            )));
        }
        self.append(&format!("\nProcess exited with code {}\n", code));
        Ok(())
    }

    fn mark_ready(&self, ready: &ServerReady) {
        info!(url = %ready.url, "Preview available");
        self.state.send_modify(|s| {
            s.preview_url = ready.url.clone();
            s.phase = Phase::Ready;
            s.terminal.push(&format!("\nServer ready at {}\n", ready.url));
        });
    }

    fn set_phase(&self, phase: Phase) {
        info!(phase = ?phase, "Session phase");
        self.state.send_modify(|s| s.phase = phase);
    }

    fn append(&self, chunk: &str) {
        self.state.send_modify(|s| s.terminal.push(chunk));
    }
}
