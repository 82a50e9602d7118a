mod config;
mod controller;
mod error;
mod events;
mod ipc;
mod persist;
mod publisher;
mod settings;
mod state;
mod supervisor;
mod sysproxy;
mod telemetry;
mod tray;

#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use publisher::Core;
use settings::Settings;
use sysproxy::PlatformBackend;
use tray::TraySurface;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(feature = "native-tray")]
    tray::native::run(|surface, clicked| runtime()?.block_on(serve(vec![surface], Some(clicked))));

    #[cfg(not(feature = "native-tray"))]
    runtime()?.block_on(serve(Vec::new(), None))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

async fn serve(
    surfaces: Vec<Arc<dyn TraySurface>>,
    clicked: Option<mpsc::UnboundedReceiver<String>>,
) -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    log::info!("[Init] Data directory: {}", settings.data_dir.display());
    log::info!("[Init] Core binary: {}", settings.core_path().display());
    let listen: SocketAddr = settings
        .ipc_listen
        .parse()
        .with_context(|| format!("invalid ipc-listen address `{}`", settings.ipc_listen))?;

    let core = Core::new(settings, Arc::new(PlatformBackend), surfaces);
    core.spawn_tray();
    if let Some(clicked) = clicked {
        route_clicks(core.clone(), clicked);
    }

    let shutdown = core.shutdown_token();
    let (_, server) = ipc::bind(core.clone(), listen, shutdown.clone())
        .with_context(|| format!("failed to bind {listen}"))?;
    let server = tokio::spawn(server);

    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match core.start(Some(path.clone())).await {
            Ok(handle) => log::info!("[Init] Core running (pid {:?})", handle.pid),
            Err(e) => log::error!("[Init] Failed to start {}: {}", path.display(), e),
        },
        None => core.autostart().await,
    }

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("failed to listen for ctrl-c")?;
            log::info!("[Init] Interrupted, shutting down");
        }
        _ = shutdown.cancelled() => log::info!("[Init] Quit requested"),
    }

    shutdown.cancel();
    core.teardown().await;
    if let Ok(Err(e)) = server.await {
        log::warn!("[IPC] Server error: {}", e);
    }
    Ok(())
}

/// Runs the actions behind clicked native tray items.
fn route_clicks(core: Arc<Core>, mut clicked: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(id) = clicked.recv().await {
            if let Err(e) = core.activate_tray_item(&id).await {
                log::warn!("[Tray] {} failed: {}", id, e);
            }
        }
    });
}
