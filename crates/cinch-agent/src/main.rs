//! Cinch executor daemon: dials the control plane, runs assigned jobs
//! in Docker containers (or bare-metal when permitted), streams logs
//! back (`spec.md` §4.6).
//!
//! Grounded on `buildit-cli`'s clap `Parser`/`Subcommand` shape,
//! extended with the `--api-url`-style `env` fallback for every flag
//! an unattended daemon needs to read from its environment instead of
//! argv.

mod cache;
mod client;
mod docker;
mod env;
mod git;
mod lifecycle;
mod scratch;
mod services;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use cinch_core::worker::WorkerMode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::client::AgentConfig;
use crate::docker::DockerRuntime;

/// Exit codes for the core CLI wrappers (`spec.md` §6.7).
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const CONNECTION: i32 = 3;
    pub const AUTH: i32 = 4;
}

#[derive(Parser)]
#[command(name = "cinch-agent")]
#[command(about = "Cinch executor daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the control plane and serve jobs until terminated.
    Run {
        /// Control plane WebSocket URL.
        #[arg(long, env = "CINCH_CONTROL_PLANE_URL")]
        control_plane_url: String,
        /// Executor bearer token issued by the control plane.
        #[arg(long, env = "CINCH_EXECUTOR_TOKEN")]
        token: String,
        /// Comma-separated label set this executor offers.
        #[arg(long, env = "CINCH_LABELS", value_delimiter = ',')]
        labels: Vec<String>,
        /// `personal` (only the owner's jobs) or `shared` (registered repos).
        #[arg(long, env = "CINCH_MODE", default_value = "personal")]
        mode: ModeArg,
        /// Repositories this executor serves when `mode = shared`, as `owner/name`.
        #[arg(long, env = "CINCH_REGISTERED_REPOS", value_delimiter = ',')]
        registered_repos: Vec<String>,
        /// Maximum number of jobs this executor runs concurrently.
        #[arg(long, env = "CINCH_CONCURRENCY", default_value_t = 1)]
        concurrency: u32,
        /// Allow `container: none` (bare-metal) job execution.
        #[arg(long, env = "CINCH_ALLOW_BARE_METAL", default_value_t = false)]
        allow_bare_metal: bool,
    },
    /// Parse a repository's in-repo pipeline config and print it back.
    Validate {
        /// Directory to discover `.cinch.*` config in.
        #[arg(default_value = ".")]
        path: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Personal,
    Shared,
}

impl From<ModeArg> for WorkerMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Personal => WorkerMode::Personal,
            ModeArg::Shared => WorkerMode::Shared,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { control_plane_url, token, labels, mode, registered_repos, concurrency, allow_bare_metal } => {
            run(control_plane_url, token, labels, mode.into(), registered_repos, concurrency, allow_bare_metal).await
        }
        Commands::Validate { path } => validate(&path),
    };
    std::process::exit(code);
}

async fn run(
    control_plane_url: String,
    token: String,
    labels: Vec<String>,
    mode: WorkerMode,
    registered_repos: Vec<String>,
    concurrency: u32,
    allow_bare_metal: bool,
) -> i32 {
    let runtime = match DockerRuntime::connect(allow_bare_metal) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to the Docker daemon");
            return exit_code::CONNECTION;
        }
    };

    let hostname = hostname();
    let config = AgentConfig {
        control_plane_url,
        token,
        labels,
        mode,
        registered_repos,
        concurrency,
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname,
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    match client::run(config, runtime, cancel).await {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "executor session terminated");
            exit_code::AUTH
        }
    }
}

fn validate(path: &str) -> i32 {
    let discovered = match cinch_config::discover(std::path::Path::new(path)) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return exit_code::CONFIG;
        }
    };
    match cinch_config::parse_file(&discovered) {
        Ok(config) => {
            println!("configuration is valid: {}", discovered.display());
            println!("build: {}", config.build);
            println!("release: {}", config.release);
            println!("timeout: {:?}", config.timeout);
            if !config.services.is_empty() {
                println!("services: {}", config.services.keys().cloned().collect::<Vec<_>>().join(", "));
            }
            exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            exit_code::CONFIG
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname_fallback().unwrap_or_else(|| "cinch-agent".to_string())
    })
}

#[cfg(unix)]
fn hostname_fallback() -> Option<String> {
    // `gethostname(2)` has no safe std wrapper; shelling out to the
    // `hostname` binary avoids pulling in a libc/nix dependency for one
    // lookup that almost always resolves via `$HOSTNAME` anyway.
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(unix))]
fn hostname_fallback() -> Option<String> {
    None
}
