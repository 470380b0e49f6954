//! A [robocam::FrameSource] backed by a GStreamer pipeline.
//!
//! The pipeline is built from [robocam::SourceConfig::pipeline_description]
//! and terminated by an `appsink` that keeps only the most recent buffer.
//! Each [robocam::FrameSource::read_frame] call pulls one sample with a
//! timeout so that a stalled camera never blocks the caller forever.

use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use gst::prelude::*;
use tracing::{debug, info, warn};

use robocam::{Error, Frame, FrameSource, Result, SourceConfig};

const SINK_NAME: &str = "robocam-sink";

/// How long a single read waits for the next sample.
pub const DEFAULT_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

struct Running {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

pub struct GstFrameSource {
    config: SourceConfig,
    name: String,
    read_timeout: std::time::Duration,
    running: Option<Running>,
    fno: usize,
}

fn _test_source_is_send() {
    // Compile-time test to ensure GstFrameSource implements Send trait.
    fn implements<T: Send>() {}
    implements::<GstFrameSource>();
}

impl GstFrameSource {
    /// Create a source for `config`.
    ///
    /// Fails with [Error::UnsupportedSource] if the configuration cannot be
    /// used on this platform. No hardware is accessed here.
    pub fn new(config: SourceConfig) -> Result<Self> {
        config.validate()?;
        let name = format!("gst:{config}");
        Ok(Self {
            config,
            name,
            read_timeout: DEFAULT_READ_TIMEOUT,
            running: None,
            fno: 0,
        })
    }

    pub fn with_read_timeout(mut self, read_timeout: std::time::Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// The full pipeline string handed to `gst::parse::launch`.
    pub fn launch_description(&self) -> String {
        format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name={SINK_NAME} max-buffers=1 drop=true sync=false",
            self.config.pipeline_description()
        )
    }
}

fn unavailable<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::DeviceUnavailable(format!("{what}: {e}"))
}

impl FrameSource for GstFrameSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        gst::init().map_err(unavailable("initializing gstreamer"))?;

        let description = self.launch_description();
        debug!("launching pipeline: {description}");
        let pipeline = gst::parse::launch(&description)
            .map_err(unavailable("parsing pipeline"))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| Error::DeviceUnavailable("launch did not yield a pipeline".into()))?;

        let appsink = pipeline
            .by_name(SINK_NAME)
            .ok_or_else(|| Error::DeviceUnavailable("appsink missing from pipeline".into()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| Error::DeviceUnavailable("sink element is not an appsink".into()))?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            // Release whatever was allocated before failing.
            let _ = pipeline.set_state(gst::State::Null);
            return Err(Error::DeviceUnavailable(format!(
                "{}: could not start pipeline: {e}",
                self.name
            )));
        }

        info!("opened {}", self.name);
        self.fno = 0;
        self.running = Some(Running { pipeline, appsink });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            if let Err(e) = running.pipeline.set_state(gst::State::Null) {
                warn!("{}: stopping pipeline failed: {e}", self.name);
            }
            info!("closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.running.is_some()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let running = self.running.as_ref().ok_or(Error::NotOpen)?;
        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = running
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| Error::ReadFailure(format!("no sample within {timeout}")))?;

        let caps = sample
            .caps()
            .ok_or_else(|| Error::ReadFailure("sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| Error::ReadFailure(format!("caps are not raw video: {e}")))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::ReadFailure("sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| Error::ReadFailure(format!("buffer not readable: {e}")))?;

        let image = rgb_image_from_strided(
            map.as_slice(),
            info.width(),
            info.height(),
            info.stride()[0] as usize,
        )?;
        let frame = Frame::new(image, self.fno);
        self.fno += 1;
        Ok(frame)
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Copy possibly row-padded RGB data into a tightly packed image.
fn rgb_image_from_strided(
    data: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<image::RgbImage> {
    let row_len = width as usize * 3;
    if width == 0 || height == 0 {
        return Err(Error::ReadFailure(format!("empty {width}x{height} buffer")));
    }
    if stride < row_len || data.len() < stride * (height as usize - 1) + row_len {
        return Err(Error::ReadFailure(format!(
            "buffer of {} bytes too small for {width}x{height} with stride {stride}",
            data.len()
        )));
    }
    let mut packed = Vec::with_capacity(row_len * height as usize);
    for row in data.chunks(stride).take(height as usize) {
        packed.extend_from_slice(&row[..row_len]);
    }
    image::RgbImage::from_raw(width, height, packed)
        .ok_or_else(|| Error::ReadFailure("could not assemble frame".into()))
}
