use std::path::PathBuf;

use anyhow::{Context, anyhow, bail};
use bridge_protocol::{ConversionRequest, Outbound};
use clap::Args;
use tracing::{debug, info};

use super::{CliContext, stop_worker};
use stepmesh::config::parse_tolerance;
use stepmesh::util::format_bytes;
use stepmesh::worker;

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// STEP file to read
    pub input: PathBuf,

    /// STL file to write
    pub output: PathBuf,

    /// Mesh tolerance, overrides STEPMESH_TOLERANCE
    #[arg(long, value_parser = tolerance_arg)]
    pub tolerance: Option<f64>,

    /// Kernel .wasm file, overrides STEPMESH_MODULE
    #[arg(long)]
    pub module: Option<PathBuf>,
}

fn tolerance_arg(raw: &str) -> Result<f64, String> {
    parse_tolerance("--tolerance", raw).map_err(|err| err.to_string())
}

pub async fn execute(args: ConvertArgs, context: &CliContext) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let tolerance = args.tolerance.unwrap_or(context.config.tolerance);

    let (worker, mut events) = context.start_worker(args.module).await?;
    if let Err(err) = worker::wait_ready(&mut events).await {
        stop_worker(worker).await;
        bail!("kernel failed to load: {err}");
    }

    let id = args.input.display().to_string();
    worker.post_message(ConversionRequest::new(text, tolerance).with_id(id))?;

    let outcome = loop {
        match events.recv().await {
            Some(Outbound::Log { log }) => info!(target: "stepmesh::log", "{log}"),
            Some(Outbound::Blob { blob, .. }) => break Ok(blob),
            Some(Outbound::Error { kind, error, .. }) => {
                break Err(anyhow!("conversion failed ({kind}): {error}"));
            }
            Some(Outbound::Ready) => debug!("duplicate ready ignored"),
            None => break Err(anyhow!("worker exited before answering")),
        }
    };
    stop_worker(worker).await;

    let blob = outcome?;
    tokio::fs::write(&args.output, &blob.data)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!(
        "Wrote {} ({}) to {}",
        args.output.display(),
        format_bytes(blob.len() as u64),
        blob.media_type
    );
    Ok(())
}
