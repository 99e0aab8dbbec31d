//! Error types for docmission

/// Transport adapter errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to the agent server")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Rejections at the `start` command boundary
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("No project path selected")]
    NoProjectPath,

    #[error("Not connected to the agent server")]
    NotConnected,

    #[error("A mission is already in flight")]
    MissionInFlight,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Inbound frames or payloads that could not be interpreted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed `{event}` payload: {reason}")]
    MalformedPayload { event: String, reason: String },
}
