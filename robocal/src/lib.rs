//! Calibration workflow for robot cameras.
//!
//! [capture] drives a timed series of shots from a
//! [frame_stream::FrameStream] into a fresh directory, `camcal` turns that
//! directory into a lens model and [preview] renders a before/after image
//! for a quick visual check. The `robocal` binary ties them together.

pub mod camera;
pub mod capture;
pub mod cli;
pub mod preview;

pub use capture::{
    CaptureSession, CaptureSessionState, ConsolePrompter, FrameProvider, Prompt, Prompter,
    RecordingPrompter, SessionConfig,
};
