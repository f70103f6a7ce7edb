mod admin;
mod app;
mod bus;
mod config;
mod detector;
mod fleet;
mod history;
mod ipcheck;
mod keyed;
mod model;
mod notify;
mod pool;
mod provider;
mod provision;
mod queue;
mod server;
mod store;

use app::ControlPlane;
use clap::Parser;
use config::{Args, KeeperConfig};
use eyre::{eyre, Result};
use fs2::FileExt;
use notify::{Notifier, NullNotifier, WebhookNotifier};
use provider::HttpProvider;
use std::fs::OpenOptions;
use std::sync::Arc;
use store::FileStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = KeeperConfig::from_args(args)?;

    if !cfg.store_file.exists() {
        return Err(eyre!(
            "store file {} does not exist",
            cfg.store_file.display()
        ));
    }

    // Single-instance guard: a second keeper sharing the store would break
    // the single-worker provisioning discipline.
    let lock_path = cfg.store_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "keeper already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let store = Arc::new(FileStore::new(cfg.store_file.clone()));
    let provider = Arc::new(HttpProvider::new(
        cfg.provider_url.clone(),
        cfg.provider_timeout,
    ));
    let notifier: Arc<dyn Notifier> = match &cfg.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), cfg.notify_timeout)),
        None => Arc::new(NullNotifier),
    };

    tracing::info!(
        store = %cfg.store_file.display(),
        listen = %cfg.listen,
        admin = %cfg.admin_listen,
        provider = %cfg.provider_url,
        notify = cfg.notify_url.is_some(),
        "keeper starting"
    );

    let plane = Arc::new(ControlPlane::new(cfg.clone(), store, provider, notifier));
    plane.pool.load().await?;

    let heartbeat_socket = TcpListener::bind(&cfg.listen)
        .await
        .map_err(|e| eyre!("failed to bind heartbeat listener on {}: {e}", cfg.listen))?;
    let admin_socket = TcpListener::bind(&cfg.admin_listen)
        .await
        .map_err(|e| eyre!("failed to bind admin listener on {}: {e}", cfg.admin_listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = plane.spawn_loops(shutdown_rx.clone());
    handles.push(tokio::spawn(server::heartbeat_listener(
        heartbeat_socket,
        plane.fleet.clone(),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(server::admin_listener(
        admin_socket,
        Arc::new(plane.admin(shutdown_rx.clone())),
        shutdown_rx,
    )));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for shutdown signal: {e}"))?;
    tracing::info!("shutdown signal received; stopping loops");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("keeper stopped");
    Ok(())
}
