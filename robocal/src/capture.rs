//! Timed capture of calibration images.
//!
//! A [CaptureSession] asks a [FrameProvider] for the latest frame once per
//! shot and writes each frame it gets to `image_{index}.{ext}` in a fresh
//! directory. Slots without a frame are skipped and do not count towards
//! the total, so a session always ends with exactly `total` files or an
//! error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use frame_stream::FrameStream;
use robocam::{Frame, FrameSource};
use tracing::{debug, info, warn};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "destination directory \"{}\" already exists, please use a different directory",
        .0.display()
    )]
    DestinationExists(PathBuf),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera error: {0}")]
    Camera(#[from] robocam::Error),
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

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send + Sync>() {}
    implements::<Error>();
}

/// Fail if `dir` exists. Checked before any hardware is touched so that an
/// earlier calibration set is never mixed with a new one.
pub fn check_destination(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Err(Error::DestinationExists(dir.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Must not exist yet. Created by the session.
    pub output_dir: PathBuf,
    /// Pause after each shot for the operator to move the target.
    pub interval: Duration,
    /// Number of images to write.
    pub total: usize,
    /// Countdown steps before the first shot.
    pub countdown: u32,
    pub countdown_step: Duration,
    /// Pause after the countdown, before the first shot.
    pub intro_pause: Duration,
    /// Abort once this many shots in a row got no frame. 0 disables the
    /// limit.
    pub max_consecutive_misses: usize,
    /// File extension, which also selects the image codec.
    pub extension: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("auto_calibrate"),
            interval: Duration::from_secs(3),
            total: 40,
            countdown: 3,
            countdown_step: Duration::from_secs(1),
            intro_pause: Duration::from_secs(3),
            max_consecutive_misses: 10,
            extension: "jpg".to_string(),
        }
    }
}

impl SessionConfig {
    /// Settings for tests and scripted runs: no pauses at all.
    pub fn immediate<P: Into<PathBuf>>(output_dir: P, total: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            interval: Duration::ZERO,
            total,
            countdown: 0,
            countdown_step: Duration::ZERO,
            intro_pause: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Path of the image written for shot `index`.
    pub fn image_path(&self, index: usize) -> PathBuf {
        self.output_dir
            .join(format!("image_{index}.{}", self.extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSessionState {
    NotStarted,
    AwaitingNextShot,
    Capturing,
    Complete,
    Aborted,
}

/// Something that hands out the most recent camera frame without waiting.
pub trait FrameProvider {
    fn latest_frame(&mut self) -> robocam::Result<Option<Arc<Frame>>>;
}

impl<S: FrameSource + 'static> FrameProvider for FrameStream<S> {
    fn latest_frame(&mut self) -> robocam::Result<Option<Arc<Frame>>> {
        self.read_latest_frame()
    }
}

impl<T: FrameProvider + ?Sized> FrameProvider for &mut T {
    fn latest_frame(&mut self) -> robocam::Result<Option<Arc<Frame>>> {
        (**self).latest_frame()
    }
}

/// Operator-facing messages during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    CountdownStart,
    Countdown(u32),
    Intro,
    Captured { number: usize, total: usize },
    Missed,
    Move,
    Done,
}

impl std::fmt::Display for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prompt::CountdownStart => write!(f, "Taking a picture in:"),
            Prompt::Countdown(n) => write!(f, "{n}..."),
            Prompt::Intro => write!(f, "Beginning image capture"),
            Prompt::Captured { number, total } => write!(f, "Captured image {number} of {total}"),
            Prompt::Missed => write!(f, "No frame from the camera, trying again"),
            Prompt::Move => write!(f, "Move the checkerboard elsewhere in the field of view"),
            Prompt::Done => write!(f, "Done capturing."),
        }
    }
}

pub trait Prompter {
    fn prompt(&mut self, prompt: Prompt);
}

/// Prints prompts to stdout.
#[derive(Debug, Default)]
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn prompt(&mut self, prompt: Prompt) {
        println!("{prompt}");
    }
}

/// Keeps prompts in memory instead of showing them.
#[derive(Debug, Default)]
pub struct RecordingPrompter {
    pub prompts: Vec<Prompt>,
}

impl Prompter for RecordingPrompter {
    fn prompt(&mut self, prompt: Prompt) {
        self.prompts.push(prompt);
    }
}

impl<T: Prompter + ?Sized> Prompter for &mut T {
    fn prompt(&mut self, prompt: Prompt) {
        (**self).prompt(prompt)
    }
}

pub struct CaptureSession<F, P> {
    config: SessionConfig,
    provider: F,
    prompter: P,
    state: CaptureSessionState,
    saved: Vec<PathBuf>,
    frame_requests: usize,
}

impl<F: FrameProvider, P: Prompter> CaptureSession<F, P> {
    pub fn new(config: SessionConfig, provider: F, prompter: P) -> Self {
        Self {
            config,
            provider,
            prompter,
            state: CaptureSessionState::NotStarted,
            saved: Vec::new(),
            frame_requests: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureSessionState {
        self.state
    }

    /// Files written so far, in shot order.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }

    /// Number of times a frame was requested from the provider.
    pub fn frame_requests(&self) -> usize {
        self.frame_requests
    }

    pub fn into_prompter(self) -> P {
        self.prompter
    }

    fn abort(&mut self, e: Error) -> Error {
        self.state = CaptureSessionState::Aborted;
        e
    }

    /// Run the whole session. Returns the written files.
    ///
    /// A session runs once. Running it again fails with
    /// [Error::CaptureFailed].
    pub fn run(&mut self) -> Result<Vec<PathBuf>> {
        if self.state != CaptureSessionState::NotStarted {
            return Err(Error::CaptureFailed(format!(
                "session already ran (state {:?})",
                self.state
            )));
        }
        if let Err(e) = check_destination(&self.config.output_dir) {
            return Err(self.abort(e));
        }
        if let Err(e) = std::fs::create_dir_all(&self.config.output_dir) {
            return Err(self.abort(e.into()));
        }
        info!(
            "capturing {} images into \"{}\"",
            self.config.total,
            self.config.output_dir.display()
        );

        if self.config.countdown > 0 {
            self.prompter.prompt(Prompt::CountdownStart);
            for n in (1..=self.config.countdown).rev() {
                self.prompter.prompt(Prompt::Countdown(n));
                std::thread::sleep(self.config.countdown_step);
            }
        }
        self.prompter.prompt(Prompt::Intro);
        std::thread::sleep(self.config.intro_pause);
        self.state = CaptureSessionState::AwaitingNextShot;

        let mut misses = 0;
        while self.saved.len() < self.config.total {
            self.state = CaptureSessionState::Capturing;
            self.frame_requests += 1;
            match self.provider.latest_frame() {
                Ok(Some(frame)) => {
                    let path = self.config.image_path(self.saved.len());
                    if let Err(e) = frame.image.save(&path) {
                        return Err(self.abort(e.into()));
                    }
                    debug!(
                        "saved frame {} to \"{}\"",
                        frame.host_timing.fno,
                        path.display()
                    );
                    self.saved.push(path);
                    misses = 0;
                    self.prompter.prompt(Prompt::Captured {
                        number: self.saved.len(),
                        total: self.config.total,
                    });
                }
                Ok(None) => {
                    misses += 1;
                    debug!("no frame available yet");
                    self.prompter.prompt(Prompt::Missed);
                }
                Err(e) if e.is_transient() => {
                    misses += 1;
                    debug!("skipping shot: {e}");
                    self.prompter.prompt(Prompt::Missed);
                }
                Err(e) => return Err(self.abort(e.into())),
            }

            let limit = self.config.max_consecutive_misses;
            if limit > 0 && misses >= limit {
                warn!("giving up after {misses} shots without a frame");
                return Err(self.abort(Error::CaptureFailed(format!(
                    "no frame for {misses} consecutive shots"
                ))));
            }

            self.state = CaptureSessionState::AwaitingNextShot;
            if self.saved.len() < self.config.total {
                if misses == 0 {
                    self.prompter.prompt(Prompt::Move);
                }
                std::thread::sleep(self.config.interval);
            }
        }

        self.state = CaptureSessionState::Complete;
        self.prompter.prompt(Prompt::Done);
        info!("captured {} images", self.saved.len());
        Ok(self.saved.clone())
    }
}
