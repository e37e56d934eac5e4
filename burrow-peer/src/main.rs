//! Burrow peer daemon: multicast transport, disk chunk store, ledger
//! persistence and the local control surface around the protocol engine.

mod config;
mod control;
mod net;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use burrow_core::{LedgerSnapshot, Peer, PeerConfig, PeerId, ProtocolVersion};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("burrow-peer {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    tracing::info!(
        peer_id = cfg.peer_id,
        version = %cfg.version,
        storage = %cfg.storage_dir.display(),
        "starting peer"
    );

    let store = Arc::new(
        storage::DiskStore::open(&cfg.storage_dir, cfg.capacity_bytes)
            .context("opening chunk store")?,
    );
    let peer_config = PeerConfig::new(
        PeerId(cfg.peer_id),
        ProtocolVersion(cfg.version.clone()),
        cfg.direct_port,
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (transport, inbox) = net::spawn_transport(&cfg)
            .await
            .context("binding transport sockets")?;

        let snapshot_path = snapshot_path(&cfg.storage_dir);
        let peer = match load_snapshot(&snapshot_path) {
            Some(snapshot) => {
                tracing::info!(path = %snapshot_path.display(), "ledger restored from snapshot");
                Peer::from_snapshot(peer_config, snapshot, store, transport)
            }
            None => Peer::new(peer_config, store, transport),
        };
        let peer = Arc::new(peer);

        peer.start(inbox);
        if let Err(err) = peer.announce() {
            tracing::warn!(%err, "startup announcement failed");
        }

        let control_listener =
            tokio::net::TcpListener::bind(("127.0.0.1", cfg.control_port))
                .await
                .context("binding control socket")?;
        tracing::info!(port = cfg.control_port, "control surface listening");
        tokio::spawn(control::serve(control_listener, Arc::clone(&peer)));

        tokio::spawn(snapshot_loop(
            Arc::clone(&peer),
            snapshot_path.clone(),
            Duration::from_secs(cfg.snapshot_interval_secs),
        ));

        shutdown_signal().await?;
        tracing::info!("shutting down");
        if let Err(err) = save_snapshot(&snapshot_path, &peer.snapshot()) {
            tracing::warn!(%err, "final snapshot failed");
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

fn snapshot_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join("ledger.snapshot")
}

fn load_snapshot(path: &Path) -> Option<LedgerSnapshot> {
    let raw = std::fs::read(path).ok()?;
    match bincode::deserialize(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "ignoring unreadable snapshot");
            None
        }
    }
}

/// Write the snapshot to a sibling temp file, then rename over the old one
/// so a crash mid-write never leaves a truncated snapshot.
fn save_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> anyhow::Result<()> {
    let raw = bincode::serialize(snapshot)?;
    let tmp = path.with_extension("snapshot.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn snapshot_loop(peer: Arc<Peer>, path: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = save_snapshot(&path, &peer.snapshot()) {
            tracing::warn!(%err, "periodic snapshot failed");
        } else {
            tracing::trace!(path = %path.display(), "ledger snapshot written");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
