use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::control::ControlServer;
use common::manifest::{CommandSet, Schema};
use wildland_sync::{HashDb, SyncDaemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (stdout_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = std::env::var("WILDLAND_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(stdout_writer)
                .with_filter(EnvFilter::new(filter)),
        )
        .init();

    let base_dir = std::env::var_os("WILDLAND_BASE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            directories::BaseDirs::new()
                .map(|dirs| dirs.config_dir().join("wildland"))
                .unwrap_or_else(|| PathBuf::from(".wildland"))
        });
    let socket_path = std::env::var_os("WILDLAND_SYNC_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join("wlsync.sock"));
    std::fs::create_dir_all(&base_dir)?;

    // HashDb drives sqlx through Handle::block_on, which must not run on
    // the async runtime itself.
    let db = tokio::task::spawn_blocking({
        let base_dir = base_dir.clone();
        let handle = tokio::runtime::Handle::current();
        move || HashDb::open(&base_dir, handle)
    })
    .await??;
    let db = Arc::new(db);
    let (daemon, mut shutdown_rx) = SyncDaemon::new(db);

    let validators = Schema::load_commands(CommandSet::Sync)?;
    let server = ControlServer::new(daemon.clone(), validators);
    let handle = server.start(&socket_path)?;
    tracing::info!("wildland-sync up; control socket {}", socket_path.display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown_rx.wait_for(|stop| *stop) => {}
    }

    tracing::info!("shutting down");
    daemon.stop_all();
    handle.stop().await;
    Ok(())
}
