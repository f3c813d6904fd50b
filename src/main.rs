mod cli;

use clap::Parser;
use tracing::{error, info};

use cli::{Cli, CliContext};
use stepmesh::config::{BridgeConfig, ConfigManager, EnvConfigManager};
use stepmesh::logger::init_tracing;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager(EnvConfigManager::new(Some(cli.env_file.clone())));
    let mut config = BridgeConfig::load(&config_manager).await?;
    cli.apply(&mut config);

    let telemetry = init_tracing(
        &config.log_level,
        config.log_dir.as_deref(),
        config.otel_endpoint.as_deref(),
    )?;
    info!(version = env!("CARGO_PKG_VERSION"), "stepmesh starting");

    let context = CliContext::new(config, config_manager);
    let result = cli::execute(&context, cli.command).await;
    if let Err(err) = &result {
        error!("{err:#}");
    }

    telemetry.shutdown();
    result
}
