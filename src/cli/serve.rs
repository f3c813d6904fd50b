use std::path::PathBuf;

use bridge_protocol::ConversionRequest;
use bridge_protocol::codec::{LineReader, write_message};
use clap::Args;
use tokio::{io, signal};
use tracing::{error, info, warn};

use super::{CliContext, stop_worker};
use stepmesh::error::ProtocolError;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Kernel .wasm file, overrides STEPMESH_MODULE
    #[arg(long)]
    pub module: Option<PathBuf>,
}

/// One request per stdin line, one outbound message per stdout line.
///
/// Requests that cannot be decoded, and requests that arrive before `ready`,
/// are logged and dropped; a request sent while another runs is answered
/// with a `busy` error by the worker itself.
pub async fn execute(args: ServeArgs, context: &CliContext) -> anyhow::Result<()> {
    let (worker, mut events) = context.start_worker(args.module).await?;

    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(message) = events.recv().await {
            if let Err(err) = write_message(&mut stdout, &message).await {
                error!("failed to write {} message: {err}", message.type_name());
                break;
            }
        }
    });

    info!("serving conversions on stdin/stdout");
    let mut reader = LineReader::new(io::stdin());
    loop {
        let next = tokio::select! {
            next = reader.next_message::<ConversionRequest>() => next,
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };
        match next {
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Ok(Some(Ok(request))) => match worker.post_message(request) {
                Ok(()) | Err(ProtocolError::Busy) => {}
                Err(ProtocolError::NotReady) => warn!("dropped request received before ready"),
                Err(ProtocolError::Closed) => {
                    error!("worker has shut down");
                    break;
                }
            },
            Ok(Some(Err(err))) => warn!("dropped malformed request: {err}"),
            Err(err) => {
                error!("failed to read stdin: {err}");
                break;
            }
        }
    }

    stop_worker(worker).await;
    if let Err(err) = writer.await {
        error!("stdout writer failed: {err}");
    }
    Ok(())
}
