use thiserror::Error;

/// Errors surfaced by the storage service and its collaborators.
///
/// None of these are ever reported back to a client as the outcome of a
/// storage mutation: protocol violations are handed to the offending
/// connection, backing-store failures degrade a map to memory-only.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error("backing store error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage worker is not running")]
    WorkerStopped,
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn protocol(msg: impl Into<String>) -> Self { Self::ProtocolViolation(msg.into()) }

    /// Stable numeric code for external mapping/logging
    pub fn code(&self) -> u16 {
        match self {
            StorageError::ProtocolViolation(_) => 2001,
            StorageError::InvalidOrigin(_) => 2002,
            StorageError::Backend(_) => 2101,
            StorageError::Io(_) => 2102,
            StorageError::Serialization(_) => 2103,
            StorageError::WorkerStopped => 2201,
            StorageError::Config(_) => 2301,
        }
    }
}

/// A write that would push an origin past its quota. Rejected as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota of {quota} bytes exceeded ({required} bytes required)")]
pub struct QuotaExceeded {
    pub quota: usize,
    pub required: usize,
}
