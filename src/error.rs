use bridge_protocol::ErrorKind;
use thiserror::Error;

/// Why a request was turned away before reaching the foreign module.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("worker is not ready; wait for the ready message")]
    NotReady,

    #[error("a conversion is already running")]
    Busy,

    #[error("worker has shut down")]
    Closed,
}

/// Errors raised while driving the foreign module.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The foreign arena refused an allocation.
    #[error("allocation of {requested} bytes failed: {reason}")]
    Allocation { requested: usize, reason: String },

    /// The kernel failed, trapped, or returned an unreadable buffer.
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A buffer was released or decoded by a session that does not own it.
    #[error("buffer at {address:#x} is not owned by this session")]
    UnownedBuffer { address: u32 },

    #[error("foreign module failure: {0:#}")]
    Module(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn conversion(reason: impl Into<String>) -> Self {
        BridgeError::Conversion(reason.into())
    }

    /// Wire classification for the `error` message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Allocation { .. } => ErrorKind::Allocation,
            BridgeError::Conversion(_) => ErrorKind::Conversion,
            BridgeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BridgeError::Protocol(ProtocolError::Busy) => ErrorKind::Busy,
            BridgeError::Protocol(ProtocolError::NotReady) => ErrorKind::NotReady,
            BridgeError::Protocol(ProtocolError::Closed) => ErrorKind::Internal,
            BridgeError::UnownedBuffer { .. } | BridgeError::Module(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let alloc = BridgeError::Allocation { requested: 12, reason: "arena exhausted".into() };
        assert_eq!(alloc.kind(), ErrorKind::Allocation);
        assert_eq!(alloc.to_string(), "allocation of 12 bytes failed: arena exhausted");
        assert_eq!(BridgeError::conversion("null output").kind(), ErrorKind::Conversion);
        assert_eq!(BridgeError::from(ProtocolError::Busy).kind(), ErrorKind::Busy);
        assert_eq!(
            BridgeError::UnownedBuffer { address: 0x40 }.to_string(),
            "buffer at 0x40 is not owned by this session"
        );
    }
}
