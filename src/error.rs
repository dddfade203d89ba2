//! Crate-wide error type.
//!
//! Transport and tool-call failures inside the pipeline are captured as
//! structured results rather than raised; this enum covers the fallible
//! seams that do propagate (configuration, storage, training, wire I/O).

use std::time::Duration;

/// Errors surfaced by gateway components.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(#[from] sqlx::Error),

    #[error("Entity extraction error: {0}")]
    Extraction(String),

    #[error("Classifier has not been trained")]
    ClassifierNotTrained,

    #[error("Training error: {0}")]
    Training(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// JSON-RPC style numeric code for transport-level failures.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::NotConnected => -32000,
            GatewayError::Timeout { .. } => -32002,
            _ => -32603,
        }
    }
}
