//! lobby-hw — Frame acquisition.
//!
//! Every video input is a [`FrameSource`]: something that can be asked,
//! repeatedly and from a blocking thread, for its freshest RGB frame.

pub mod camera;
pub mod frame;
pub mod network;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use network::NetworkSource;

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("failed to start decoder: {0}")]
    DecoderSpawn(#[source] std::io::Error),
    #[error("no frame within {0:?}")]
    Timeout(std::time::Duration),
    #[error("source not configured: {0}")]
    NotConfigured(String),
}

/// A pull-style video input.
///
/// `read_frame` blocks until a frame is available or the read fails. A failed
/// read does not invalidate the source; callers may simply try again.
pub trait FrameSource: Send {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    fn read_frame(&mut self) -> Result<RgbImage, SourceError>;
}
