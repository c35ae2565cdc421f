// fsmesh-node: peer-replicated file metadata server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fsmesh_core::{FileStore, FsCore, Roster, SnapshotSink};
use fsmesh_node::config::{self, Config};
use fsmesh_node::mesh::Mesh;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fsmesh-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!(
                "unknown argument {other:?} (usage: fsmesh-node [--config <path>] [--version])"
            ),
        }
    }

    init_tracing();
    let cfg = config::load(config_path.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let local = cfg.local_id();
    let peers = cfg.peer_ids()?;

    std::fs::create_dir_all(&cfg.storage_root)
        .with_context(|| format!("creating storage root {}", cfg.storage_root.display()))?;
    if let Some(dir) = cfg.snapshot_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;
    }

    let sink = SnapshotSink::new(&cfg.snapshot_file);
    let table = sink.load();
    info!(entries = table.len(), snapshot = %cfg.snapshot_file.display(), "metadata loaded");
    let core = FsCore::new(
        table,
        Roster::new(local.clone(), peers),
        FileStore::new(&cfg.storage_root),
        sink,
    );

    let listener = match TcpListener::bind((cfg.host.as_str(), cfg.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(host = %cfg.host, port = cfg.port, error = %e, "cannot bind listener");
            return Err(e).context("binding listener");
        }
    };
    info!(node = %local, peers = cfg.peers.len(), "listening");

    let mesh = Mesh::new(core, Duration::from_secs(cfg.reconnect_interval_secs.max(1)));
    mesh.run_until(listener, shutdown_signal()).await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
        }
    }
}
