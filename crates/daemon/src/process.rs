//! Process bootstrap for the mount daemon: logging, control socket,
//! optional kernel mount, graceful shutdown.

use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::control::ControlServer;
use common::manifest::{CommandSet, Schema};
use common::storage::BackendRegistry;

use crate::config::Config;
use crate::fs::WildlandFs;

/// Initialize logging. Returns guards that must be kept alive for the
/// duration of the program.
pub fn init_logging(config: &Config) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(EnvFilter::new(config.log_level.clone()));

    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!("warning: cannot create log directory {:?}: {}", log_dir, e);
        }
        let file_appender = tracing_appender::rolling::daily(log_dir, "wildland-fs.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(EnvFilter::new(config.log_level.clone()));

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {}", info);
    }));

    guards
}

/// Run the daemon until a shutdown signal arrives.
pub async fn start_service(config: Config) -> anyhow::Result<()> {
    let fs = Arc::new(WildlandFs::new(
        BackendRegistry::with_defaults(),
        config.default_user.clone(),
    ));

    let validators = Schema::load_commands(CommandSet::Fs)?;
    let server = ControlServer::new(fs.clone(), validators);
    let server_handle = server.start(&config.socket_path)?;

    #[cfg(feature = "fuse")]
    let fuse_session = if config.no_fuse {
        None
    } else {
        match crate::fuse::spawn_mount(fs.clone(), &config.mount_dir) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::error!(
                    "cannot mount at {}: {} (control socket stays up)",
                    config.mount_dir.display(),
                    e
                );
                None
            }
        }
    };

    tracing::info!("wildland-fs up; control socket {}", config.socket_path.display());
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    #[cfg(feature = "fuse")]
    if let Some(session) = fuse_session {
        session.join();
    }
    server_handle.stop().await;
    Ok(())
}
