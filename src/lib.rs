//! epaper-frame: turn photos into 2bpp e-paper buffers and manage a BLE photo frame.
//!
//! Main modules:
//! - palette: fixed panel palettes and nearest-color lookup
//! - dithering: crop, resize and Floyd-Steinberg encoding
//! - protocol: command/response frames and raster packing
//! - queue: single-lane operation queue
//! - session: one connected frame and its commands
//! - upload: chunked upload with retry
//! - ble: btleplug transport
//! - config: config.toml

pub mod ble;
pub mod config;
pub mod dithering;
pub mod error;
pub mod palette;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod upload;

/// BLE API: scan/connect to frames
pub use ble::{connect, scan, BleFrame, DiscoveredFrame};
pub use config::FrameConfig;
/// Image codec
pub use dithering::{encode, encode_from_path, Orientation, ProcessedImage};
pub use error::{FrameError, Result};
pub use palette::{ColorMode, PaletteColor};
/// Protocol utilities (frames, pixel packing, etc)
pub use protocol::*;
pub use session::{DeviceState, FrameSession, LinkEvent, ListenerId, SessionEvent, Transport};
pub use upload::{CancelToken, UploadProgress, UploadRequest, UploadState};
