//! Error types for sessions, sandboxes and the wire protocol

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Plugin load failed: {id}\n  Reason: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("Plugin scan failed: {id}\n  Reason: {reason}")]
    ScanFailed { id: String, reason: String },

    #[error("Sandbox error: {0}")]
    SandboxFailed(String),

    #[error("Lost connection to sandbox master")]
    MasterDisconnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GridError {
    /// True for errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            GridError::SessionClosed | GridError::MasterDisconnected => true,
            GridError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
