use std::path::{Path, PathBuf};

use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    CalibrationSet, CalibrationTargetPoints, Error, ImageSize, LensModel, LensSolver,
    PatternDetector, PatternGeometry, Result, SelectionStrategy, filter_to_common_size,
    list_candidate_images,
    mean_accuracy, project_points, reprojection_error,
};

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub pattern: PatternGeometry,
    /// Stop selecting once this many images have been accepted.
    pub target_images: usize,
    /// The attempt budget is `target_images * budget_multiplier`.
    pub budget_multiplier: usize,
    pub strategy: SelectionStrategy,
    /// Seed for the selection order. A random seed is drawn (and logged) if
    /// not set.
    pub seed: Option<u64>,
    /// Half size of the sub-pixel corner search window, in pixels.
    pub subpix_window: (u32, u32),
    /// Free scaling parameter of the optimal camera matrix.
    pub alpha: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            pattern: PatternGeometry::default(),
            target_images: 15,
            budget_multiplier: 4,
            strategy: SelectionStrategy::default(),
            seed: None,
            subpix_window: (11, 11),
            alpha: 1.0,
        }
    }
}

impl SolverConfig {
    pub fn attempt_budget(&self) -> usize {
        self.target_images * self.budget_multiplier
    }
}

/// Result of a successful calibration run.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub lens_model: LensModel,
    pub set: CalibrationSet,
    /// Reprojection error of each view in `set`.
    pub per_image_error: Vec<f64>,
    /// Number of candidate images evaluated during selection.
    pub attempts: usize,
}

pub struct CalibrationSolver<D, S> {
    config: SolverConfig,
    detector: D,
    solver: S,
}

impl<D: PatternDetector, S: LensSolver> CalibrationSolver<D, S> {
    pub fn new(config: SolverConfig, detector: D, solver: S) -> Self {
        Self {
            config,
            detector,
            solver,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Select images in `dirname` in which the pattern is detected.
    ///
    /// Returns the accepted set and the number of attempts made. Stops at
    /// [SolverConfig::target_images] accepted images or when the attempt
    /// budget runs out, whichever comes first.
    pub fn collect(&self, dirname: &Path) -> Result<(CalibrationSet, usize)> {
        let candidates = list_candidate_images(dirname)?;
        let Some((image_size, candidates)) = filter_to_common_size(candidates) else {
            return Err(Error::NoCandidateImages(dirname.to_path_buf()));
        };

        let pattern = self.config.pattern;
        let target = self.config.target_images;
        let budget = self.config.attempt_budget();
        let seed = self.config.seed.unwrap_or_else(|| rand::rng().random());
        debug!("selection seed: {seed}");
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let order = self
            .config
            .strategy
            .attempt_order(candidates.len(), budget, &mut rng);

        info!(
            "Attempting to find {}x{} chessboard in up to {} of {} {image_size} images ({}).",
            pattern.cols,
            pattern.rows,
            order.len(),
            candidates.len(),
            self.config.strategy,
        );

        let object_points = pattern.object_points();
        let mut views = Vec::with_capacity(target);
        let mut attempts = 0;

        for idx in order {
            if views.len() >= target {
                break;
            }
            attempts += 1;
            let path = &candidates[idx];

            let gray = match image::open(path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    continue;
                }
            };
            let size = ImageSize::new(gray.width(), gray.height());
            if size != image_size {
                let e = Error::ImageSizeMismatch {
                    path: path.clone(),
                    actual: size,
                    expected: image_size,
                };
                warn!("skipping: {e}");
                continue;
            }

            let corners = match self.detector.find_corners(&gray, &pattern) {
                Ok(Some(corners)) => corners,
                Ok(None) => {
                    info!("rejected {}: pattern not found", path.display());
                    continue;
                }
                Err(e) => {
                    warn!("rejected {}: {e}", path.display());
                    continue;
                }
            };
            if corners.len() != pattern.num_corners() {
                warn!(
                    "rejected {}: {} corners, expected {}",
                    path.display(),
                    corners.len(),
                    pattern.num_corners()
                );
                continue;
            }
            let refined =
                match self
                    .detector
                    .refine_corners(&gray, corners, self.config.subpix_window)
                {
                    Ok(refined) => refined,
                    Err(e) => {
                        warn!("rejected {}: refining corners: {e}", path.display());
                        continue;
                    }
                };

            views.push(CalibrationTargetPoints {
                source: path.clone(),
                object_points: object_points.clone(),
                image_points: refined,
            });
            info!(
                "accepted {} ({}/{})",
                path.display(),
                views.len(),
                target
            );
        }

        if views.is_empty() {
            return Err(Error::InsufficientCalibrationData { attempts });
        }
        if views.len() < target {
            warn!(
                "attempt budget of {budget} exhausted, proceeding with {} of {target} images",
                views.len()
            );
        }

        let mut set = CalibrationSet::new(pattern, image_size);
        set.views = views;
        Ok((set, attempts))
    }

    /// Solve the lens and score it by reprojection.
    ///
    /// Returns the model and the reprojection error of each view.
    pub fn solve(&self, set: &CalibrationSet) -> Result<(LensModel, Vec<f64>)> {
        if set.is_empty() {
            return Err(Error::InsufficientCalibrationData { attempts: 0 });
        }
        let solved = self.solver.solve(set)?;
        if solved.poses.len() != set.len() {
            return Err(Error::Backend(format!(
                "solver returned {} poses for {} views",
                solved.poses.len(),
                set.len()
            )));
        }

        let k = &solved.camera_matrix;
        let intrinsics = RosOpenCvIntrinsics::from_params_with_distortion(
            k[(0, 0)],
            k[(0, 1)],
            k[(1, 1)],
            k[(0, 2)],
            k[(1, 2)],
            Distortion::from_opencv_vec(solved.distortion),
        );

        let per_image_error: Vec<f64> = set
            .views
            .iter()
            .zip(solved.poses.iter())
            .map(|(view, pose)| {
                let projected = project_points(&intrinsics, pose, &view.object_points);
                reprojection_error(&view.image_points, &projected)
            })
            .collect();
        let accuracy = mean_accuracy(&per_image_error);
        info!("Mean accuracy: {accuracy}");

        let model = LensModel::from_solved(&solved, set.image_size, self.config.alpha, accuracy)?;
        debug!("solved lens model: {model:?}");
        Ok((model, per_image_error))
    }

    /// Select, solve and score. Nothing is written to disk.
    pub fn calibrate(&self, dirname: &Path) -> Result<Calibration> {
        let (set, attempts) = self.collect(dirname)?;
        let (lens_model, per_image_error) = self.solve(&set)?;
        Ok(Calibration {
            lens_model,
            set,
            per_image_error,
            attempts,
        })
    }

    /// Like [CalibrationSolver::calibrate], then persist the model into
    /// `dirname`. No file is written if calibration fails.
    pub fn calibrate_and_save(
        &self,
        dirname: &Path,
        pkg_name: &str,
    ) -> Result<(Calibration, PathBuf)> {
        let calibration = self.calibrate(dirname)?;
        let params_file = calibration
            .lens_model
            .save(dirname, pkg_name, chrono::Local::now())?;
        Ok((calibration, params_file))
    }
}
