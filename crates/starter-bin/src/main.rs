//! # starter
//! Thin command-line entry point around `starter-core`: the privileged
//! bootstrap process of a container runtime. A higher-level engine invokes
//! this binary (or links `starter-core` directly) to take a process from a
//! single invocation through STAGE1, an optional RPC_SERVER, STAGE2 and
//! MASTER.
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use starter_core::config::StarterConfig;
use starter_core::error::ChoreographError;
use starter_core::process::choreographer::{self, Hooks};
use starter_core::shared_config::{cleanenv, ingest_engine_config_from_env, EngineConfigError};

#[derive(Parser, Debug)]
#[clap(version, author = env!("CARGO_PKG_AUTHORS"))]
pub struct Opts {
    /// Enable debug-level logging; overridden by --log-level if both are given.
    #[clap(long, global = true)]
    pub debug: bool,

    /// error, warn, info, debug, or trace.
    #[clap(long, global = true)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// text or json.
    #[clap(long, global = true)]
    pub log_format: Option<String>,

    /// Mirror logs to the systemd journal in addition to the configured sink.
    #[clap(long, global = true)]
    pub systemd_log: bool,

    /// Load the starter configuration from a JSON file instead of the
    /// environment-chunk transport an engine would normally use. Intended
    /// for local testing of the choreographer in isolation.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Run without requiring the binary to be installed setuid-root.
    #[clap(long)]
    pub without_suid: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {:?}", e);
    }

    tracing::debug!(
        pid = nix::unistd::getpid().as_raw(),
        euid = nix::unistd::geteuid().as_raw(),
        "starter invoked"
    );

    let config = load_config(&opts)?;

    let hooks = Hooks {
        stage1: Box::new(|config: &mut StarterConfig| {
            tracing::info!("stage1: deciding namespace actions for the engine");
            let _ = config;
            0
        }),
        master: Box::new(|config: &StarterConfig, parent_to_signal: Option<nix::unistd::Pid>| {
            tracing::info!(container_pid = config.container.pid, "master: supervising container");
            if let Some(parent) = parent_to_signal {
                if let Err(e) = starter_core::daemon::signal_ready(parent) {
                    tracing::warn!(error = %e, "failed to signal instance-daemon parent");
                }
            }
            0
        }),
        rpc_server: Box::new(|_config: &StarterConfig| {
            tracing::info!("rpc_server: awaiting privileged operation requests");
            0
        }),
        stage2: Box::new(|_config: &StarterConfig| {
            tracing::info!("stage2: handing off to the container workload");
            0
        }),
    };

    let code = choreographer::run(config, hooks)
        .map_err(ChoreographError::from)
        .context("choreography failed")?;
    std::process::exit(code);
}

fn load_config(opts: &Opts) -> Result<StarterConfig> {
    let mut config = match &opts.config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read config file {path:?}"))?;
            serde_json::from_slice(&bytes).context("failed to parse config file")?
        }
        None => StarterConfig::new(),
    };

    match ingest_engine_config_from_env() {
        Ok(blob) => {
            config.engine.size = blob.len();
            config.engine.config = blob;
        }
        // No engine transport configured (e.g. --config file mode); every
        // other ingestion failure is a real misconfiguration and propagates.
        Err(EngineConfigError::MissingEnv(ref var)) if var == "ENGINE_CONFIG_CHUNK_ENV" => {}
        Err(e) => return Err(ChoreographError::from(e)).context("failed to ingest engine config"),
    }
    config.starter.is_suid = !opts.without_suid && nix::unistd::geteuid().is_root() && !nix::unistd::getuid().is_root();

    cleanenv(&["PATH", "HOME", "TERM"]);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_vec(&StarterConfig::new()).unwrap()).unwrap();
        let opts = Opts {
            debug: false,
            log_level: None,
            log_file: None,
            log_format: None,
            systemd_log: false,
            config: Some(path),
            without_suid: true,
        };
        assert!(load_config(&opts).is_ok());
    }
}
