use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camcal::{CalibrationSolver, PatternGeometry, SelectionStrategy, SolverConfig};
use clap::{Parser, Subcommand};
use eyre::{self, WrapErr};
use frame_stream::FrameStream;
use tracing::{error, info};
use undistort_image::UndistortOperator;

use crate::capture::{self, CaptureSession, ConsolePrompter, SessionConfig};
use crate::{camera, preview};

/// calibrate, undistort and test robot cameras
#[derive(Debug, Parser)]
#[command(name = "robocal", author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// capture chessboard images and compute the lens model
    Calibrate(CalibrateArgs),
    /// remove lens distortion from image files
    Undistort(UndistortArgs),
    /// run a camera and report the frame rate
    Stream(StreamArgs),
}

#[derive(Debug, clap::Args)]
pub struct CameraArgs {
    /// Camera source: a webcam index, `default`, `picam`, `jetson` or an
    /// http/rtsp URL.
    #[arg(short, long, default_value = "default")]
    pub camera: String,

    /// TOML file describing the camera source. Overrides `--camera`.
    #[arg(long)]
    pub source_config: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct CalibrateArgs {
    /// Interval in seconds between image captures.
    #[arg(short, long, default_value_t = 3.0)]
    pub interval: f64,

    /// Total number of photos to capture.
    #[arg(short, long, default_value_t = 40)]
    pub total: usize,

    /// Number of checkerboard images to use in calibration.
    #[arg(short, long, default_value_t = 15)]
    pub num: usize,

    /// Where captured images and results are saved.
    #[arg(short, long, default_value = "auto_calibrate")]
    pub output: PathBuf,

    #[command(flatten)]
    pub camera: CameraArgs,

    /// Undistort one calibration image and save a before/after preview.
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new())]
    pub preview: bool,

    /// Skip image capture, calibrate from the images already in `--output`.
    #[arg(short = 'z', long)]
    pub skip: bool,

    /// Inner corners per chessboard row.
    #[arg(long, default_value_t = 9)]
    pub cols: usize,

    /// Inner corners per chessboard column.
    #[arg(long, default_value_t = 6)]
    pub rows: usize,

    /// Chessboard square size in object units.
    #[arg(long, default_value_t = 1.0)]
    pub square_size: f64,

    /// How candidate images are drawn.
    #[arg(long, default_value_t = SelectionStrategy::default())]
    pub strategy: SelectionStrategy,

    /// Seed for the random image selection.
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, clap::Args)]
pub struct UndistortArgs {
    /// Lens model written by `robocal calibrate`.
    #[arg(long)]
    pub params: PathBuf,

    /// Images to undistort.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output directory. Files keep their names.
    #[arg(short, long, default_value = "undistorted")]
    pub output: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct StreamArgs {
    #[command(flatten)]
    pub camera: CameraArgs,

    /// How long to run, in seconds.
    #[arg(long, default_value_t = 5.0)]
    pub seconds: f64,

    /// Undistort frames with this lens model.
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// Save the last frame to this file.
    #[arg(long)]
    pub save: Option<PathBuf>,
}

fn seconds(value: f64, what: &str) -> eyre::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what} {value}"))
}

fn open_stream(args: &CameraArgs) -> eyre::Result<FrameStream<camera::DynSource>> {
    let config = camera::source_config(&args.camera, args.source_config.as_deref())?;
    info!("using camera source {config}");
    let source = camera::open_source(&config)?;
    Ok(FrameStream::new(source))
}

fn stop_stream(stream: &mut FrameStream<camera::DynSource>) {
    if let Err(e) = stream.stop() {
        error!("stopping camera: {e}");
    }
}

pub fn calibrate(args: CalibrateArgs) -> eyre::Result<()> {
    let output_dir = std::path::absolute(&args.output)?;

    if !args.skip {
        capture::check_destination(&output_dir)?;
        let mut stream = open_stream(&args.camera)?;
        stream.start().context("starting camera")?;

        let config = SessionConfig {
            output_dir: output_dir.clone(),
            interval: seconds(args.interval, "interval")?,
            total: args.total,
            ..Default::default()
        };
        let result = CaptureSession::new(config, &mut stream, ConsolePrompter).run();
        stop_stream(&mut stream);
        result?;
        println!("Done capturing. Beginning calibration...");
    }

    let (detector, lens_solver) = camcal::default_backend()?;
    let config = SolverConfig {
        pattern: PatternGeometry {
            cols: args.cols,
            rows: args.rows,
            square_size: args.square_size,
        },
        target_images: args.num,
        strategy: args.strategy,
        seed: args.seed,
        ..Default::default()
    };
    let solver = CalibrationSolver::new(config, detector, lens_solver);
    let (calibration, params_file) = solver
        .calibrate_and_save(&output_dir, env!("CARGO_PKG_NAME"))
        .with_context(|| format!("calibrating from \"{}\"", output_dir.display()))?;
    println!(
        "Calibrated from {} images, mean accuracy {:.2}%",
        calibration.set.len(),
        calibration.lens_model.mean_accuracy
    );
    println!("Lens model saved to \"{}\"", params_file.display());

    if args.preview {
        if let Some(view) = calibration.set.views.first() {
            let operator = UndistortOperator::new(calibration.lens_model.clone());
            // Only an aid for the operator.
            if let Err(e) = preview::write_preview(&output_dir, &view.source, &operator) {
                error!("writing preview: {e:#}");
            }
        }
    }
    Ok(())
}

pub fn undistort(args: UndistortArgs) -> eyre::Result<()> {
    let operator = UndistortOperator::from_file(&args.params)
        .with_context(|| format!("loading lens model \"{}\"", args.params.display()))?;
    std::fs::create_dir_all(&args.output)?;
    for input in &args.inputs {
        let out_path = output_path(&args.output, input)?;
        let img = image::open(input)
            .with_context(|| format!("reading \"{}\"", input.display()))?
            .to_rgb8();
        let undistorted = operator.undistort(&img)?;
        undistorted
            .save(&out_path)
            .with_context(|| format!("writing \"{}\"", out_path.display()))?;
        info!("{} -> {}", input.display(), out_path.display());
    }
    Ok(())
}

fn output_path(dir: &Path, input: &Path) -> eyre::Result<PathBuf> {
    let name = input
        .file_name()
        .ok_or_else(|| eyre::eyre!("\"{}\" has no file name", input.display()))?;
    Ok(dir.join(name))
}

pub fn stream(args: StreamArgs) -> eyre::Result<()> {
    let duration = seconds(args.seconds, "duration")?;
    let mut stream = open_stream(&args.camera)?;
    if let Some(params) = &args.params {
        stream.set_preprocessor(UndistortOperator::from_file(params)?);
    }

    let start = Instant::now();
    let mut last_fno = None;
    let mut distinct = 0usize;
    let mut last_frame = None;
    let result = (|| -> eyre::Result<()> {
        while start.elapsed() < duration {
            if let Some(frame) = stream.read_latest_frame()? {
                if last_fno != Some(frame.host_timing.fno) {
                    last_fno = Some(frame.host_timing.fno);
                    distinct += 1;
                }
                last_frame = Some(frame);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    })();
    let failures = stream.read_failure_count();
    stop_stream(&mut stream);
    result?;

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "{distinct} distinct frames in {elapsed:.1} s ({:.1} fps), {failures} failed reads",
        distinct as f64 / elapsed
    );
    if let (Some(path), Some(frame)) = (&args.save, last_frame) {
        frame.save(path)?;
        println!("last frame saved to \"{}\"", path.display());
    }
    Ok(())
}

pub fn run(cli: Cli) -> eyre::Result<()> {
    match cli.command {
        Command::Calibrate(args) => calibrate(args),
        Command::Undistort(args) => undistort(args),
        Command::Stream(args) => stream(args),
    }
}
