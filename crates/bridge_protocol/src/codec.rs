//! Newline-delimited JSON framing for the stdio transport.
//!
//! One message per line, UTF-8, `\n` terminated. Blank lines are skipped and
//! a trailing `\r` is tolerated so the transport works with Windows pipes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialises `msg` as a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line. Returns `Ok(None)` for a blank line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<Option<T>, CodecError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(msg)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads raw lines off an async byte stream.
pub struct LineReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: BufReader::new(reader), line: String::new() }
    }

    /// Next non-blank line without its terminator, `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if !trimmed.trim().is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Next decoded message. A malformed line yields `Some(Err(..))` so the
    /// caller can report it and keep reading.
    pub async fn next_message<T: DeserializeOwned>(
        &mut self,
    ) -> std::io::Result<Option<Result<T, CodecError>>> {
        Ok(self.next_line().await?.map(|line| {
            serde_json::from_str::<T>(&line).map_err(CodecError::from)
        }))
    }
}
