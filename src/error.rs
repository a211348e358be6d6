//! Error types shared by the codec, protocol and session layers.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ResponseCode;
use crate::upload::UploadState;

/// Everything that can go wrong talking to (or preparing images for) a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// No response arrived within the command timeout.
    #[error("timed out waiting for a response to command 0x{opcode:02X}")]
    Timeout { opcode: u8 },

    /// The device answered with a code that does not fit the command in flight.
    #[error("unexpected response 0x{actual:02X} to command 0x{opcode:02X} (expected {expected:?})")]
    UnexpectedResponse {
        opcode: u8,
        expected: ResponseCode,
        actual: u8,
    },

    /// The device answered ERROR.
    #[error("device rejected command 0x{opcode:02X}: {message}")]
    Device { opcode: u8, message: String },

    /// A write on the link failed.
    #[error("transport write failed: {0}")]
    Transport(String),

    /// BLE stack failure.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The link went away (or was never there).
    #[error("link to frame lost")]
    LinkLost,

    /// Image decoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// The source image or palette cannot be encoded.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A response payload did not have the expected shape.
    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image names travel as newline-separated text, so some names are unusable.
    #[error("invalid image name {0:?}")]
    InvalidName(String),

    /// An upload failed; `sent` is how far it got.
    #[error("upload failed during {phase} after {sent}/{total} bytes: {source}")]
    UploadFailed {
        phase: UploadState,
        sent: usize,
        total: usize,
        #[source]
        source: Box<FrameError>,
    },

    /// The caller cancelled an upload between chunks.
    #[error("upload cancelled after {sent}/{total} bytes")]
    UploadCancelled { sent: usize, total: usize },

    /// The operation queue worker is gone.
    #[error("operation queue closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for FrameError
pub type Result<T> = std::result::Result<T, FrameError>;

impl FrameError {
    /// Create a transport error with message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a payload error with message
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// Byte offset reached when an upload stopped, if this is an upload error.
    pub fn upload_offset(&self) -> Option<(usize, usize)> {
        match self {
            Self::UploadFailed { sent, total, .. } | Self::UploadCancelled { sent, total } => {
                Some((*sent, *total))
            }
            _ => None,
        }
    }
}
