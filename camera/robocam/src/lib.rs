//! Frame sources for robot-mounted cameras.
//!
//! A [FrameSource] owns a hardware or network handle and exposes exactly three
//! operations: [FrameSource::open], [FrameSource::close] and
//! [FrameSource::read_frame]. Which backend pipeline gets built is decided by a
//! [SourceConfig], an explicit tagged value chosen at construction time.
//!
//! Threaded acquisition lives in the `frame-stream` crate and the GStreamer
//! backend in `robocam-gst`.

use std::sync::Arc;

mod preprocess;
mod source_config;

pub use preprocess::{FramePreprocessor, PreprocessorChain};
pub use source_config::{JetsonCamera, Resolution, SourceConfig};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device or pipeline could not be opened.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The requested source kind cannot be used in this build or on this
    /// platform. Raised before any hardware access.
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    /// No frame was delivered this cycle. Transient; retry on the next cycle.
    #[error("frame read failed: {0}")]
    ReadFailure(String),
    #[error("source is not open")]
    NotOpen,
    #[error("acquisition thread did not finish within {0:?}")]
    StopTimeout(std::time::Duration),
    #[error("previous acquisition thread has not released the source yet")]
    PreviousStopPending,
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
}

impl Error {
    /// Whether the error only affects the current read cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ReadFailure(_))
    }
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send + Sync>() {}
    implements::<Error>();
}

// ---------------------------
// Frame

/// Timing information acquired on the host computer.
#[derive(Debug, Clone)]
pub struct HostTimingInfo {
    /// The frame number as counted by the source since it was opened.
    ///
    /// Gaps appear if frames were dropped by the backend.
    pub fno: usize,
    /// The time the frame was received by the host.
    pub datetime: chrono::DateTime<chrono::Utc>,
}

impl HostTimingInfo {
    pub fn now(fno: usize) -> Self {
        Self {
            fno,
            datetime: chrono::Utc::now(),
        }
    }
}

/// A captured 3-channel color image.
///
/// Frames are never mutated after capture. Consumers share them through
/// `Arc<Frame>` and derive new frames instead of editing pixels in place.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data, 8 bits per channel, RGB order.
    pub image: image::RgbImage,
    pub host_timing: HostTimingInfo,
}

impl Frame {
    pub fn new(image: image::RgbImage, fno: usize) -> Self {
        Self {
            image,
            host_timing: HostTimingInfo::now(fno),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Build a new frame with different pixels but the same timing info.
    pub fn with_image(&self, image: image::RgbImage) -> Self {
        Self {
            image,
            host_timing: self.host_timing.clone(),
        }
    }

    /// Write the frame to disk. The codec is picked from the file extension.
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.image.save(path)?;
        Ok(())
    }
}

/// A frame shared between the acquisition thread and its readers.
pub type SharedFrame = Arc<Frame>;

// ---------------------------
// FrameSource

/// A camera backend.
///
/// Implementations differ only in how [FrameSource::open] builds the
/// underlying pipeline.
pub trait FrameSource: Send {
    /// Human readable description used in log messages.
    fn name(&self) -> &str;

    /// Acquire the device handle. Fails with [Error::DeviceUnavailable].
    fn open(&mut self) -> Result<()>;

    /// Release the device handle. Calling this on a closed source is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Blocking read of one frame.
    ///
    /// Fails with [Error::ReadFailure] if the hardware returned nothing during
    /// this call. Callers should retry on the next cycle.
    fn read_frame(&mut self) -> Result<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame()
    }
}
