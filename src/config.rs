//! Command-line and environment configuration.

use crate::error::Result;
use crate::output::DEFAULT_TERMINAL_CAP;
use crate::session::SessionCommands;
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::Args, Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the assessment API
    #[arg(long, env = "EXAMBOX_BACKEND_URL", default_value = "http://127.0.0.1:8000")]
    pub backend_url: String,

    /// Timeout for backend requests in seconds
    #[arg(long, env = "EXAMBOX_HTTP_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

impl BackendConfig {
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.http_timeout))
            .build()?;
        Ok(client)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct SandboxConfig {
    /// Directory holding sandbox instances (defaults to the system temp dir)
    #[arg(long, env = "EXAMBOX_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Dependency install command
    #[arg(long, env = "EXAMBOX_INSTALL_CMD", default_value = "npm install")]
    pub install_cmd: String,

    /// Command starting the preview server
    #[arg(long, env = "EXAMBOX_RUN_CMD", default_value = "npm run dev")]
    pub run_cmd: String,

    /// Terminal buffer cap per session in bytes
    #[arg(long, env = "EXAMBOX_TERMINAL_CAP", default_value_t = DEFAULT_TERMINAL_CAP)]
    pub terminal_cap: usize,
}

impl SandboxConfig {
    pub fn commands(&self) -> SessionCommands {
        SessionCommands {
            install: self.install_cmd.clone(),
            run: self.run_cmd.clone(),
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct AutosaveConfig {
    /// WebSocket URL of the backend event channel; the autosave relay is
    /// disabled without it
    #[arg(long, env = "EXAMBOX_AUTOSAVE_URL")]
    pub autosave_url: Option<String>,

    /// Seconds between autosave snapshots
    #[arg(long, env = "EXAMBOX_AUTOSAVE_INTERVAL", default_value = "5")]
    pub autosave_interval: u64,

    /// Seconds to wait before reconnecting the event channel
    #[arg(long, env = "EXAMBOX_AUTOSAVE_RECONNECT", default_value = "3")]
    pub autosave_reconnect: u64,
}

impl AutosaveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.autosave_reconnect)
    }
}
