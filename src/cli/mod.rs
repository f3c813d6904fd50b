use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bridge_protocol::Outbound;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;

pub mod convert;
pub mod schema;
pub mod serve;

use convert::ConvertArgs;
use schema::SchemaArgs;
use serve::ServeArgs;

use stepmesh::config::{BridgeConfig, ConfigManager};
use stepmesh::module::{ModuleSource, WasmModule};
use stepmesh::worker::{self, WorkerHandle};

#[derive(Parser, Debug)]
#[command(
    name = "stepmesh",
    about = "Mesh STEP solids into STL through a sandboxed WebAssembly kernel",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Directory for the rolling text log and the JSON conversion report
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long, global = true)]
    pub otel_endpoint: Option<String>,

    /// .env file loaded before reading STEPMESH_* settings
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,
}

impl Cli {
    /// Command-line flags win over environment settings.
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if let Some(endpoint) = &self.otel_endpoint {
            config.otel_endpoint = Some(endpoint.clone());
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert one STEP file to STL
    Convert(ConvertArgs),

    /// Serve conversions over JSON lines on stdin/stdout
    Serve(ServeArgs),

    /// Emit JSON-Schema for the wire messages
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config: BridgeConfig,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config: BridgeConfig, config_manager: ConfigManager) -> Self {
        Self { config, config_manager }
    }

    /// Spawn a worker around the configured kernel, or `module` if given.
    /// Kernel location and export names are read from the config manager at
    /// spawn time.
    pub async fn start_worker(
        &self,
        module: Option<PathBuf>,
    ) -> anyhow::Result<(WorkerHandle, UnboundedReceiver<Outbound>)> {
        let config = BridgeConfig::load(&self.config_manager).await?;
        let source = match module {
            Some(path) => ModuleSource::File(path),
            None => config.module_source()?,
        };
        let exports = config.exports;
        worker::spawn(move |outbox| WasmModule::load(&source, &exports, Arc::new(outbox)))
            .context("Failed to start worker thread")
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Convert(args) => convert::execute(args, context).await,
        Commands::Serve(args) => serve::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}

/// Stop the worker without blocking the runtime.
pub async fn stop_worker(worker: WorkerHandle) {
    if let Err(err) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
        tracing::error!("worker shutdown task failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepmesh::config::{MODULE_KEY, MapConfigManager};

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "stepmesh",
            "--log-level",
            "debug",
            "convert",
            "part.step",
            "part.stl",
            "--tolerance",
            "0.2",
        ]);
        let mut config = BridgeConfig { log_dir: Some("logs".into()), ..BridgeConfig::default() };
        cli.apply(&mut config);

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        match cli.command {
            Commands::Convert(args) => {
                assert_eq!(args.input, PathBuf::from("part.step"));
                assert_eq!(args.tolerance, Some(0.2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_needs_a_kernel_location() {
        let context = CliContext::new(BridgeConfig::default(), ConfigManager(MapConfigManager::new()));
        let err = context.start_worker(None).await.unwrap_err();
        assert!(err.to_string().contains(MODULE_KEY), "{err}");
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
