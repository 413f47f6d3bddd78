//! Corelink error types.

use thiserror::Error;

/// Corelink errors
#[derive(Error, Debug)]
pub enum CoreError {
    // === Framing Errors ===
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Message parameter error: {0}")]
    MessageParams(String),

    // === Session Errors ===
    #[error("Bad Counter")]
    BadCounter,

    #[error("Got an Ignore")]
    GotAnIgnore,

    #[error("Token collision on slot {0:#04x}")]
    TokenCollision(u8),

    #[error("Session not ready")]
    NotReady,

    #[error("locked during flashing")]
    FlashInProgress,

    #[error("Request timed out")]
    Timeout,

    #[error("Session disconnected: {0}")]
    Disconnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Verb Errors ===
    #[error("No device state!")]
    NoDeviceState,

    #[error("Unknown Function")]
    UnknownFunction,

    #[error("Variable not found")]
    UnknownVariable,

    #[error("Update failed: {0}")]
    Flash(String),

    // === Handshake / Crypto Errors ===
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    // === Configuration Errors ===
    #[error("Config error: {0}")]
    Config(String),

    // === Standard Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for corelink operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<hex::FromHexError> for CoreError {
    fn from(err: hex::FromHexError) -> Self {
        CoreError::Crypto(format!("Hex decode error: {err}"))
    }
}

impl CoreError {
    /// Whether this error must tear the session down.
    ///
    /// Only counter violations, handshake failure and socket errors
    /// disconnect; everything else surfaces to the originating verb.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::BadCounter
                | CoreError::GotAnIgnore
                | CoreError::TokenCollision(_)
                | CoreError::Handshake(_)
                | CoreError::Io(_)
        )
    }
}
