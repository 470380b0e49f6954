//! Camera calibration from a directory of checkerboard images.
//!
//! The pipeline is: list candidate images ([list_candidate_images]), pick
//! a usable subset in which the checkerboard is detected
//! ([CalibrationSolver::collect]), solve for the lens parameters and score
//! the result by reprojection ([CalibrationSolver::solve]), then persist a
//! [LensModel].
//!
//! Corner detection and the lens solver are collaborators behind the
//! [PatternDetector] and [LensSolver] traits. With the `opencv` feature,
//! [default_backend] returns implementations backed by OpenCV.

use std::path::PathBuf;

use nalgebra::{Matrix3, Rotation3, Vector3, Vector5};
use serde::{Deserialize, Serialize};

mod candidates;
mod lens_model;
#[cfg(feature = "opencv")]
mod opencv_backend;
mod reprojection;
mod selection;
mod solver;

pub use candidates::{PREVIEW_FILE_NAME, filter_to_common_size, list_candidate_images};
pub use lens_model::{LensModel, PARAMS_FILE_NAME, optimal_new_camera_matrix};
pub use reprojection::{mean_accuracy, project_points, reprojection_error};
pub use selection::SelectionStrategy;
pub use solver::{Calibration, CalibrationSolver, SolverConfig};

#[cfg(feature = "opencv")]
pub use opencv_backend::{OpenCvDetector, OpenCvSolver};

pub type Coords3D = (f64, f64, f64);
pub type Coords2D = (f64, f64);

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("calibration image directory \"{}\": {reason}", path.display())]
    SourceDirectory { path: PathBuf, reason: String },
    #[error("no candidate images in \"{}\"", .0.display())]
    NoCandidateImages(PathBuf),
    #[error("calibration pattern not detected in any of {attempts} attempted images")]
    InsufficientCalibrationData { attempts: usize },
    #[error("invalid lens model \"{source_name}\": {reason}")]
    InvalidLensModel { source_name: String, reason: String },
    #[error("no calibration backend compiled in (enable the `opencv` feature)")]
    NoBackend,
    #[error("calibration backend: {0}")]
    Backend(String),
    #[error("image \"{}\" is {actual}, expected {expected}", path.display())]
    ImageSizeMismatch {
        path: PathBuf,
        actual: ImageSize,
        expected: ImageSize,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("glob pattern: {0}")]
    Glob(#[from] glob::PatternError),
}

/// Inner-corner geometry of a checkerboard target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternGeometry {
    /// Number of inner corners per row.
    pub cols: usize,
    /// Number of inner corners per column.
    pub rows: usize,
    /// Distance between neighbouring corners, in object units.
    pub square_size: f64,
}

impl Default for PatternGeometry {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            square_size: 1.0,
        }
    }
}

impl PatternGeometry {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            ..Default::default()
        }
    }

    pub fn num_corners(&self) -> usize {
        self.cols * self.rows
    }

    /// Corner positions on the target plane, row-major, `z = 0`.
    pub fn object_points(&self) -> Vec<Coords3D> {
        let s = self.square_size;
        (0..self.rows)
            .flat_map(|row| (0..self.cols).map(move |col| (col as f64 * s, row as f64 * s, 0.0)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Correspondences for one accepted image.
#[derive(Debug, Clone)]
pub struct CalibrationTargetPoints {
    /// The image the corners were detected in.
    pub source: PathBuf,
    pub object_points: Vec<Coords3D>,
    pub image_points: Vec<Coords2D>,
}

/// Accepted views in selection order.
#[derive(Debug, Clone)]
pub struct CalibrationSet {
    pub pattern: PatternGeometry,
    pub image_size: ImageSize,
    pub views: Vec<CalibrationTargetPoints>,
}

impl CalibrationSet {
    pub fn new(pattern: PatternGeometry, image_size: ImageSize) -> Self {
        Self {
            pattern,
            image_size,
            views: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Pose of the target relative to the camera for one view.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn identity_at(translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation,
        }
    }
}

/// Output of a [LensSolver].
#[derive(Debug, Clone)]
pub struct SolvedLens {
    pub camera_matrix: Matrix3<f64>,
    /// `(k1, k2, p1, p2, k3)`
    pub distortion: Vector5<f64>,
    /// One pose per view of the input set, in the same order.
    pub poses: Vec<Pose>,
}

/// Finds checkerboard corners in a monochrome image.
pub trait PatternDetector {
    /// Returns `Ok(None)` if the full pattern is not visible.
    fn find_corners(
        &self,
        image: &image::GrayImage,
        pattern: &PatternGeometry,
    ) -> Result<Option<Vec<Coords2D>>>;

    /// Refine corner positions to sub-pixel accuracy. `window` is the half
    /// size of the search neighbourhood.
    fn refine_corners(
        &self,
        image: &image::GrayImage,
        corners: Vec<Coords2D>,
        window: (u32, u32),
    ) -> Result<Vec<Coords2D>>;
}

/// Fits intrinsics, distortion and per-view poses to a [CalibrationSet].
pub trait LensSolver {
    fn solve(&self, set: &CalibrationSet) -> Result<SolvedLens>;
}

impl<T: PatternDetector + ?Sized> PatternDetector for Box<T> {
    fn find_corners(
        &self,
        image: &image::GrayImage,
        pattern: &PatternGeometry,
    ) -> Result<Option<Vec<Coords2D>>> {
        (**self).find_corners(image, pattern)
    }
    fn refine_corners(
        &self,
        image: &image::GrayImage,
        corners: Vec<Coords2D>,
        window: (u32, u32),
    ) -> Result<Vec<Coords2D>> {
        (**self).refine_corners(image, corners, window)
    }
}

impl<T: LensSolver + ?Sized> LensSolver for Box<T> {
    fn solve(&self, set: &CalibrationSet) -> Result<SolvedLens> {
        (**self).solve(set)
    }
}

/// The detector and solver compiled into this build.
#[cfg(feature = "opencv")]
pub fn default_backend() -> Result<(Box<dyn PatternDetector>, Box<dyn LensSolver>)> {
    Ok((Box::new(OpenCvDetector), Box::new(OpenCvSolver)))
}

/// The detector and solver compiled into this build.
#[cfg(not(feature = "opencv"))]
pub fn default_backend() -> Result<(Box<dyn PatternDetector>, Box<dyn LensSolver>)> {
    Err(Error::NoBackend)
}
