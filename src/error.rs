//! Error taxonomy shared by the live pipelines
//!
//! Errors that cross a pipeline boundary are delivered as events rather than
//! returned, so the type carried by those events has to be cheap to clone.
//! Lower-level failures (I/O, JSON, WebSocket) are flattened into one of the
//! categories below together with their message.

/// Error carried by client, recorder and playback events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    /// Camera or microphone access was denied. Needs user action.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Socket or HTTP connect/send failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be parsed. The connection survives.
    #[error("Malformed frame: {reason}")]
    Protocol { raw: String, reason: String },

    /// Audio hardware busy, missing or failed during teardown.
    #[error("Audio device error: {0}")]
    Device(String),

    /// Scratch file or chunk conversion failure. The affected chunk is skipped.
    #[error("Resource error: {0}")]
    Resource(String),
}

/// Coarse category of a [`LiveError`], handy for UI decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permission,
    Transport,
    Protocol,
    Device,
    Resource,
}

impl LiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission(_) => ErrorKind::Permission,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Device(_) => ErrorKind::Device,
            Self::Resource(_) => ErrorKind::Resource,
        }
    }

    /// Whether the pipeline recovers on its own (skip-and-continue) without
    /// the caller having to do anything.
    pub fn is_self_healing(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Resource)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<std::io::Error> for LiveError {
    fn from(e: std::io::Error) -> Self {
        Self::Resource(e.to_string())
    }
}
