//! exambox - assessment sandbox previews with an API proxy.
//!
//! Usage:
//!   exambox serve [--port 8080] [--autosave-url ws://...]  # Start HTTP server
//!   exambox preview <tree.json>             # Run one preview session locally
//!   exambox check [--threshold-mbps 1]      # Network checks against the backend

use clap::{Parser, Subcommand};
use exambox::autosave::WsEventSink;
use exambox::config::{AutosaveConfig, BackendConfig, SandboxConfig};
use exambox::http_server;
use exambox::proctor::{NetworkProbe, DEFAULT_THRESHOLD_MBPS};
use exambox::proxy::ApiProxy;
use exambox::sandbox::{ProcessBooter, SharedSandbox};
use exambox::session::{SandboxSession, SessionState};
use exambox::state::AppState;
use exambox::tree::TreeNode;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "exambox")]
#[command(about = "Assessment sandbox previews, API proxy and environment checks")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "EXAMBOX_PORT", default_value = "8080")]
        port: u16,

        #[command(flatten)]
        backend: BackendConfig,

        #[command(flatten)]
        sandbox: SandboxConfig,

        #[command(flatten)]
        autosave: AutosaveConfig,
    },
    /// Boot a sandbox, mount a project tree and stream its output
    Preview {
        /// JSON file holding the project tree
        tree: PathBuf,

        #[command(flatten)]
        sandbox: SandboxConfig,
    },
    /// Run the throughput and clock-sync checks
    Check {
        #[command(flatten)]
        backend: BackendConfig,

        /// Minimum download speed in Mbps
        #[arg(long, default_value_t = DEFAULT_THRESHOLD_MBPS)]
        threshold_mbps: f64,

        /// Fixed-size resource used for the download probe
        #[arg(long, default_value = "/speed-test.bin")]
        probe_path: String,

        /// Endpoint returning {"serverTime": ...}
        #[arg(long, default_value = "/api/server-time")]
        time_path: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve {
            port,
            backend,
            sandbox,
            autosave,
        } => serve(port, backend, sandbox, autosave).await,
        Commands::Preview { tree, sandbox } => preview(tree, sandbox).await,
        Commands::Check {
            backend,
            threshold_mbps,
            probe_path,
            time_path,
        } => check(backend, threshold_mbps, probe_path, time_path).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn shared_sandbox(config: &SandboxConfig) -> Arc<SharedSandbox> {
    let booter = ProcessBooter::new(config.workspace_dir());
    Arc::new(SharedSandbox::new(Arc::new(booter)))
}

async fn serve(
    port: u16,
    backend: BackendConfig,
    sandbox: SandboxConfig,
    autosave: AutosaveConfig,
) -> exambox::Result<()> {
    let proxy = ApiProxy::new(backend.http_client()?, backend.backend_url.clone());
    let mut state = AppState::new(
        shared_sandbox(&sandbox),
        Arc::new(proxy),
        sandbox.commands(),
        sandbox.terminal_cap,
    );
    if let Some(url) = &autosave.autosave_url {
        // The connection task lives as long as the process.
        let (sink, _connection) = WsEventSink::connect(url.clone(), autosave.reconnect_delay());
        state = state.with_autosave(Arc::new(sink), autosave.interval());
    }
    http_server::run_server(port, state).await
}

async fn preview(tree_path: PathBuf, config: SandboxConfig) -> exambox::Result<()> {
    let raw = tokio::fs::read_to_string(&tree_path).await?;
    let tree: TreeNode = serde_json::from_str(&raw)?;
    tree.validate()?;

    let session = Arc::new(SandboxSession::new(
        shared_sandbox(&config),
        config.commands(),
        config.terminal_cap,
    ));
    let mut rx = session.subscribe();
    let mut driver = tokio::spawn({
        let session = session.clone();
        async move { session.start(&tree).await }
    });

    let mut printed: u64 = 0;
    let mut announced = false;
    let joined = loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let preview_url = {
                    let state = rx.borrow_and_update();
                    echo_new_output(&state, &mut printed);
                    state.preview_url.clone()
                };
                if !announced && !preview_url.is_empty() {
                    announced = true;
                    eprintln!("Preview: {}", preview_url);
                }
            }
            joined = &mut driver => break joined,
            _ = tokio::signal::ctrl_c() => {
                driver.abort();
                return Ok(());
            }
        }
    };
    echo_new_output(&rx.borrow(), &mut printed);

    match joined {
        Ok(result) => result,
        Err(e) => Err(exambox::Error::Sandbox(e.to_string())),
    }
}

/// Print terminal text not yet echoed. `printed` counts bytes since session
/// start, including ones the buffer has since dropped.
fn echo_new_output(state: &SessionState, printed: &mut u64) {
    let text = state.terminal.as_str();
    let start = printed.saturating_sub(state.terminal.dropped()) as usize;
    if start < text.len() && text.is_char_boundary(start) {
        print!("{}", &text[start..]);
    }
    *printed = state.terminal.dropped() + text.len() as u64;
}

async fn check(
    backend: BackendConfig,
    threshold_mbps: f64,
    probe_path: String,
    time_path: String,
) -> exambox::Result<()> {
    let probe = NetworkProbe::new(
        backend.http_client()?,
        backend.backend_url.clone(),
        probe_path,
        time_path,
    );
    let report = probe.run(threshold_mbps).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !(report.throughput.ok && report.clock_sync.ok) {
        exit(2);
    }
    Ok(())
}
