//! spacegridd — the SpaceGrid daemon.
//!
//! Single binary that assembles the engine:
//! - State store (redb)
//! - Routing index + reconciler
//! - Capability rooms + idle evictor
//! - Event hub workers
//! - HTTP API (spaces, sockets, REST)
//!
//! # Usage
//!
//! ```text
//! spacegridd serve --config /etc/spacegrid/spacegrid.toml --port 8443
//! spacegridd config > spacegrid.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use spacegrid_api::{StaticTokenSigner, build_router};
use spacegrid_core::{SpaceGridConfig, UnconfiguredRuntime};
use spacegrid_engine::Engine;
use spacegrid_state::StateStore;

#[derive(Parser)]
#[command(name = "spacegridd", about = "SpaceGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and serve HTTP.
    Serve {
        /// Path to spacegrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.listen`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spacegridd=debug,spacegrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config, port, data_dir)?;
            run(config).await
        }
        Command::Config => {
            print!("{}", SpaceGridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(
    path: Option<PathBuf>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<SpaceGridConfig> {
    let mut config = match path {
        Some(path) => SpaceGridConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SpaceGridConfig::default(),
    };
    if let Some(port) = port {
        let mut addr: SocketAddr = config
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid server.listen {}", config.server.listen))?;
        addr.set_port(port);
        config.server.listen = addr.to_string();
    }
    if let Some(data_dir) = data_dir {
        config.server.data_dir = data_dir;
    }
    Ok(config)
}

async fn run(config: SpaceGridConfig) -> anyhow::Result<()> {
    info!("SpaceGrid daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("spacegrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // The script binding lives outside this binary; template and api
    // routes fail until one is wired in.
    warn!("no script runtime configured, script handlers will fail");
    let runtime = Arc::new(UnconfiguredRuntime);

    let signer = Arc::new(StaticTokenSigner::new(config.auth.tokens.clone()));
    if config.auth.tokens.is_empty() {
        warn!("no auth tokens configured, every API call will be rejected");
    }

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid server.listen {}", config.server.listen))?;

    let engine = Arc::new(Engine::new(config, store, runtime));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.start(shutdown_rx)?;

    // ── Start API server ───────────────────────────────────────

    let router = build_router(engine.clone(), signer);
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("SpaceGrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_port_and_data_dir() {
        let config = load_config(None, Some(9000), Some(PathBuf::from("/tmp/sg"))).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.data_dir, PathBuf::from("/tmp/sg"));
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spacegrid.toml");
        std::fs::write(&path, "[server]\nlisten = \"127.0.0.1:7000\"\n[events]\nsweep_interval_ms = 250\n").unwrap();

        let config = load_config(Some(path), None, None).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.events.sweep_interval_ms, 250);
        assert_eq!(config.events.event_queue, 13);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/spacegrid.toml")), None, None).is_err());
    }
}
