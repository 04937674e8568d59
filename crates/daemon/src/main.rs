use wildland_daemon::config::Config;
use wildland_daemon::process::{init_logging, start_service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let _guards = init_logging(&config);
    start_service(config).await
}
