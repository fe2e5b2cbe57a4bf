use std::time::Duration;
use thiserror::Error;

/// Why a single frame could not be turned into a reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("CRC checksum mismatch (expected 0x{expected:04x}, received 0x{received:04x})")]
    ChecksumFailed { expected: u16, received: u16 },

    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Device exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Sink rejected credentials: {0}")]
    AuthError(String),

    #[error("Firmware download failed: {0}")]
    DownloadError(String),

    #[error("Firmware checksum mismatch (expected {expected}, computed {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Device did not enter bootloader within {0:?}")]
    BootloaderEntryTimeout(Duration),

    #[error("Firmware transfer failed: {0}")]
    TransferError(String),

    #[error("Device did not come back as telemetry device within {0:?}")]
    VerificationTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout occurred")]
    Timeout,
}

impl WatcherError {
    /// Errors worth retrying automatically. Auth and firmware integrity
    /// failures always need a human.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            WatcherError::LinkUnavailable(_)
                | WatcherError::LinkLost(_)
                | WatcherError::SinkUnavailable(_)
                | WatcherError::DownloadError(_)
                | WatcherError::Timeout
        )
    }
}

impl From<sqlx::Error> for WatcherError {
    fn from(err: sqlx::Error) -> Self {
        WatcherError::Storage(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for WatcherError {
    fn from(err: serde_json::Error) -> Self {
        WatcherError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for WatcherError {
    fn from(err: toml::de::Error) -> Self {
        WatcherError::Config(format!("TOML error: {}", err))
    }
}

impl From<serialport::Error> for WatcherError {
    fn from(err: serialport::Error) -> Self {
        WatcherError::LinkUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for WatcherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            WatcherError::Config(format!("HTTP request: {}", err))
        } else {
            WatcherError::SinkUnavailable(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for WatcherError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        WatcherError::Timeout
    }
}

pub type WatcherResult<T> = Result<T, WatcherError>;
