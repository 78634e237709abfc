//! Sandbox capability and the shared instance guard.
//!
//! The execution environment is a black box behind [`Sandbox`]: it hands out
//! isolated [`Workspace`]s, each of which can mount a payload, spawn
//! commands and announce servers. One instance is shared per process
//! through [`SharedSandbox`], which joins concurrent boot requests onto a
//! single in-flight boot.

use crate::error::{Error, Result};
use crate::output::{reader_chunks, OutputChunk};
use crate::tree::{check_segment, materialize, MountTree};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

/// Out-of-band "a server is listening" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// A process started inside a workspace.
pub struct SpawnedProcess {
    pub output: BoxStream<'static, io::Result<OutputChunk>>,
    /// Resolves with the exit code once the process ends. Dropping it kills
    /// the process and everything it started.
    pub exit: BoxFuture<'static, Result<Option<i32>>>,
}

/// A booted sandbox instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Open a fresh workspace named `id`. Workspaces do not see each other's
    /// files or server announcements.
    async fn workspace(&self, id: &str) -> Result<Arc<dyn Workspace>>;
}

/// One project's view of the sandbox.
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn mount(&self, payload: &MountTree) -> Result<()>;

    /// Spawn a shell command line in the mounted project root.
    async fn spawn(&self, command: &str) -> Result<SpawnedProcess>;

    /// Servers started by processes of this workspace.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// Creates sandbox instances.
#[async_trait]
pub trait Booter: Send + Sync {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>>;
}

/// Process-wide sandbox handle with a guarded async initialiser.
pub struct SharedSandbox {
    booter: Arc<dyn Booter>,
    instance: OnceCell<Arc<dyn Sandbox>>,
}

impl SharedSandbox {
    pub fn new(booter: Arc<dyn Booter>) -> Self {
        Self {
            booter,
            instance: OnceCell::new(),
        }
    }

    /// Get the instance, booting it on first use. Callers arriving while a
    /// boot is pending wait for that boot. A failed boot is not cached.
    pub async fn acquire(&self) -> Result<Arc<dyn Sandbox>> {
        let instance = self
            .instance
            .get_or_try_init(|| async {
                info!("Booting sandbox instance");
                let booted = self.booter.boot().await;
                if let Err(e) = &booted {
                    warn!(error = %e, "Sandbox boot failed");
                }
                booted
            })
            .await?;
        Ok(Arc::clone(instance))
    }

    pub fn is_booted(&self) -> bool {
        self.instance.initialized()
    }
}

/// Boots [`ProcessSandbox`] instances under a workspace directory.
#[derive(Debug, Clone)]
pub struct ProcessBooter {
    workspace_dir: PathBuf,
}

impl ProcessBooter {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Booter for ProcessBooter {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>> {
        let root = self
            .workspace_dir
            .join(format!("exambox-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await?;
        info!(root = ?root, "Process sandbox ready");
        Ok(Arc::new(ProcessSandbox::new(root)))
    }
}

/// Sandbox backed by a local directory and `sh -c`. Each workspace is a
/// subdirectory of the instance root.
pub struct ProcessSandbox {
    root: PathBuf,
}

impl ProcessSandbox {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn workspace(&self, id: &str) -> Result<Arc<dyn Workspace>> {
        check_segment(id)?;
        let root = self.root.join(id);
        if tokio::fs::try_exists(&root).await? {
            return Err(Error::Sandbox(format!("workspace {} already exists", id)));
        }
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = ?root, "Workspace created");
        Ok(Arc::new(ProcessWorkspace::new(root)))
    }
}

/// Workspace directory of a [`ProcessSandbox`].
///
/// Output of every spawned process is scanned for a local server URL; the
/// first announcement of each port per process is broadcast as
/// [`ServerReady`] to this workspace's subscribers only.
pub struct ProcessWorkspace {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl ProcessWorkspace {
    fn new(root: PathBuf) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self { root, ready_tx }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for ProcessWorkspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[async_trait]
impl Workspace for ProcessWorkspace {
    async fn mount(&self, payload: &MountTree) -> Result<()> {
        materialize(payload, &self.root).await?;
        debug!(root = ?self.root, entries = payload.len(), "Mounted payload");
        Ok(())
    }

    async fn spawn(&self, command: &str) -> Result<SpawnedProcess> {
        info!(command, "Spawning process");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("spawn {}: {}", command, e)))?;
        let group = ProcessGroup(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("stderr not captured".to_string()))?;

        let mut detector = ReadyDetector::new(self.ready_tx.clone());
        let output = stream::select(reader_chunks(stdout), reader_chunks(stderr))
            .map(move |chunk| {
                if let Ok(OutputChunk::Bytes(bytes)) = &chunk {
                    detector.feed(&String::from_utf8_lossy(bytes));
                }
                chunk
            })
            .boxed();

        let exit = async move {
            let _group = group;
            let status = child.wait().await?;
            Ok::<_, Error>(status.code())
        }
        .boxed();

        Ok(SpawnedProcess { output, exit })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

/// Process group led by a spawned shell. Dropping it kills the group, so
/// servers the shell started in the background go with it.
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.0.and_then(|id| i32::try_from(id).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            // ESRCH once every member has exited.
            if killpg(Pid::from_raw(pgid), Signal::SIGKILL).is_ok() {
                debug!(pgid, "Killed process group");
            }
        }
    }
}

/// Line-buffered scan for `http://localhost:<port>` style announcements.
struct ReadyDetector {
    line: String,
    announced: HashSet<u16>,
    tx: broadcast::Sender<ServerReady>,
}

impl ReadyDetector {
    fn new(tx: broadcast::Sender<ServerReady>) -> Self {
        Self {
            line: String::new(),
            announced: HashSet::new(),
            tx,
        }
    }

    fn feed(&mut self, text: &str) {
        for c in text.chars() {
            if c == '\n' || c == '\r' {
                let line = std::mem::take(&mut self.line);
                self.scan(&line);
            } else {
                self.line.push(c);
            }
        }
        // Long lines without a newline are scanned eagerly.
        if self.line.len() > 4096 {
            let line = std::mem::take(&mut self.line);
            self.scan(&line);
        }
    }

    fn scan(&mut self, line: &str) {
        let Some(port) = find_local_port(&strip_ansi(line)) else {
            return;
        };
        if self.announced.insert(port) {
            let ready = ServerReady {
                port,
                url: format!("http://localhost:{}", port),
            };
            info!(url = %ready.url, "Server ready");
            // No subscribers is fine.
            let _ = self.tx.send(ready);
        }
    }
}

const LOCAL_HOSTS: [&str; 3] = ["http://localhost:", "http://127.0.0.1:", "http://0.0.0.0:"];

/// First local URL in `line` that carries a port.
fn find_local_port(line: &str) -> Option<u16> {
    let mut found: Option<(usize, u16)> = None;
    for prefix in LOCAL_HOSTS {
        for (at, _) in line.match_indices(prefix) {
            let digits: String = line[at + prefix.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(port) = digits.parse() {
                if found.map_or(true, |(first, _)| at < first) {
                    found = Some((at, port));
                }
                break;
            }
        }
    }
    found.map(|(_, port)| port)
}

fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
