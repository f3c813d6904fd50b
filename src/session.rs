use bridge_protocol::{Blob, ConversionRequest, OCTET_STREAM};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::event::{LogEvent, LogSink};
use crate::marshal::Marshaler;
use crate::module::ForeignModule;
use crate::util::format_bytes;

/// Bytes produced by one successful conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub payload: Vec<u8>,
    pub media_type: &'static str,
}

impl ConversionResult {
    pub fn octet_stream(payload: Vec<u8>) -> Self {
        Self { payload, media_type: OCTET_STREAM }
    }

    pub fn into_blob(self) -> Blob {
        Blob { media_type: self.media_type.to_string(), data: self.payload }
    }
}

/// Rejects requests the kernel must never see.
pub fn validate(request: &ConversionRequest) -> Result<()> {
    if !request.tolerance.is_finite() || request.tolerance <= 0.0 {
        return Err(BridgeError::InvalidRequest(format!(
            "tolerance must be a positive number, got {}",
            request.tolerance
        )));
    }
    Ok(())
}

/// Runs one conversion against `module`.
///
/// Both the input buffer and the kernel's output buffer are released before
/// this returns, whichever step fails.
#[tracing::instrument(
    name = "conversion",
    skip_all,
    fields(text_len = request.text.len(), tolerance = request.tolerance)
)]
pub fn run<M>(
    module: &mut M,
    request: &ConversionRequest,
    sink: &dyn LogSink,
) -> Result<ConversionResult>
where
    M: ForeignModule + ?Sized,
{
    validate(request)?;

    let mut marshaler = Marshaler::new(module);
    let input = marshaler.encode(&request.text)?;
    sink.emit(LogEvent::new(format!("Received file of size {}", input.length)));

    let output = marshaler.convert(input, request.tolerance)?;
    let text = marshaler.decode(output)?;
    let size = text.len();
    sink.emit(LogEvent::new(format!(
        "STL file size: {} or {}",
        size,
        format_bytes(size as u64)
    )));

    let result = ConversionResult::octet_stream(text.into_bytes());
    marshaler.finish()?;

    info!(output_len = size, "conversion finished");
    debug!(stats = ?module.stats(), "session closed");
    Ok(result)
}
