use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Media type carried by every conversion result.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// One conversion request, as sent by the caller.
///
/// On the wire this is the bare object `{ "text": ..., "tolerance": ... }`;
/// `id` is optional and echoed back on the final message of the request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConversionRequest {
    pub text: String,
    pub tolerance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ConversionRequest {
    pub fn new(text: impl Into<String>, tolerance: f64) -> Self {
        Self { text: text.into(), tolerance, id: None }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Binary payload with its media type. `data` travels as base64 in JSON.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Blob {
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    #[schemars(with = "String")]
    pub data: Vec<u8>,
}

impl Blob {
    pub fn octet_stream(data: Vec<u8>) -> Self {
        Self { media_type: OCTET_STREAM.to_string(), data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Failure classes reported on `error` messages.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The foreign arena refused an allocation.
    Allocation,
    /// The kernel failed or produced an unreadable buffer.
    Conversion,
    /// The request was malformed (e.g. a non-positive tolerance).
    InvalidRequest,
    /// A request arrived while another conversion was running.
    Busy,
    /// A request arrived before the worker announced readiness.
    NotReady,
    /// The foreign module could not be loaded.
    Load,
    Internal,
}

/// Everything a worker can say to its caller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    /// Emitted exactly once, before any other message.
    Ready,
    Log {
        log: String,
    },
    Blob {
        blob: Blob,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Error {
        kind: ErrorKind,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl Outbound {
    pub fn log(message: impl Into<String>) -> Self {
        Outbound::Log { log: message.into() }
    }

    pub fn error(kind: ErrorKind, error: impl Into<String>, id: Option<String>) -> Self {
        Outbound::Error { kind, error: error.into(), id }
    }

    /// `true` for the message that closes a request (`blob` or `error`).
    pub fn is_final(&self) -> bool {
        matches!(self, Outbound::Blob { .. } | Outbound::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Outbound::Ready => "ready",
            Outbound::Log { .. } => "log",
            Outbound::Blob { .. } => "blob",
            Outbound::Error { .. } => "error",
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
