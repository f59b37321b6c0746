use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// A live session already exists for this remote id
    #[error("Duplicate session for remote id: {0}")]
    DuplicateKey(String),

    /// Inbound signaling payload is missing fields or has the wrong shape
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Session negotiator rejected a description or candidate
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Signaling transport could not connect, send or acknowledge
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Device link error [{device}]: {reason}")]
    DeviceLinkFailure { device: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short, stable name of the error category (used as a log field)
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DuplicateKey(_) => "duplicate_key",
            AppError::MalformedMessage(_) => "malformed_message",
            AppError::NegotiationFailure(_) => "negotiation_failure",
            AppError::TransportFailure(_) => "transport_failure",
            AppError::DeviceLinkFailure { .. } => "device_link_failure",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether this error should end the signaling channel it occurred on
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::TransportFailure(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
