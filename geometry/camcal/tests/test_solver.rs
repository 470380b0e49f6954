use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use approx::assert_relative_eq;
use nalgebra::{Matrix3, Vector3, Vector5};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};
use test_log::test;

use camcal::{
    CalibrationSet, CalibrationSolver, Coords2D, Error, LensModel, LensSolver, PARAMS_FILE_NAME,
    PatternDetector, PatternGeometry, Pose, Result, SelectionStrategy, SolvedLens, SolverConfig,
};

const FX: f64 = 80.0;
const CX: f64 = 15.5;
const CY: f64 = 11.5;

fn camera_matrix() -> Matrix3<f64> {
    Matrix3::new(FX, 0.0, CX, 0.0, FX, CY, 0.0, 0.0, 1.0)
}

fn pose() -> Pose {
    Pose::identity_at(Vector3::new(-1.0, -0.5, 20.0))
}

fn pattern() -> PatternGeometry {
    PatternGeometry::new(3, 2)
}

/// Write `n` images whose first pixel encodes their index.
fn write_images(dir: &Path, n: u8) {
    for i in 0..n {
        let img = image::GrayImage::from_pixel(32, 24, image::Luma([i * 10]));
        img.save(dir.join(format!("image_{i}.png"))).unwrap();
    }
}

/// Detects the pattern only in images whose index is in `hits`.
///
/// Detected corners are the exact projection of the pattern through
/// [camera_matrix] at [pose], so [StubSolver] fits them perfectly.
struct StubDetector {
    hits: BTreeSet<u8>,
    calls: AtomicUsize,
}

impl StubDetector {
    fn new(hits: impl IntoIterator<Item = u8>) -> Self {
        Self {
            hits: hits.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PatternDetector for &StubDetector {
    fn find_corners(
        &self,
        image: &image::GrayImage,
        pattern: &PatternGeometry,
    ) -> Result<Option<Vec<Coords2D>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = image.get_pixel(0, 0).0[0] / 10;
        if !self.hits.contains(&index) {
            return Ok(None);
        }
        let intrinsics = RosOpenCvIntrinsics::from_params_with_distortion(
            FX,
            0.0,
            FX,
            CX,
            CY,
            Distortion::from_opencv_vec(Vector5::zeros()),
        );
        Ok(Some(camcal::project_points(
            &intrinsics,
            &pose(),
            &pattern.object_points(),
        )))
    }

    fn refine_corners(
        &self,
        _image: &image::GrayImage,
        corners: Vec<Coords2D>,
        window: (u32, u32),
    ) -> Result<Vec<Coords2D>> {
        assert_eq!(window, (11, 11));
        Ok(corners)
    }
}

struct StubSolver;

impl LensSolver for StubSolver {
    fn solve(&self, set: &CalibrationSet) -> Result<SolvedLens> {
        Ok(SolvedLens {
            camera_matrix: camera_matrix(),
            distortion: Vector5::zeros(),
            poses: vec![pose(); set.len()],
        })
    }
}

fn config(target_images: usize) -> SolverConfig {
    SolverConfig {
        pattern: pattern(),
        target_images,
        seed: Some(42),
        ..Default::default()
    }
}

#[test]
fn accepts_exactly_the_detected_images() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 10);
    let detector = StubDetector::new([1, 3, 5, 7]);
    let solver = CalibrationSolver::new(config(4), &detector, StubSolver);

    let calibration = solver.calibrate(dir.path()).unwrap();
    assert_eq!(calibration.set.len(), 4);
    let mut accepted: Vec<_> = calibration
        .set
        .views
        .iter()
        .map(|v| v.source.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    accepted.sort();
    assert_eq!(accepted, ["image_1.png", "image_3.png", "image_5.png", "image_7.png"]);
    assert!(calibration.attempts <= 10);
    assert_eq!(calibration.set.image_size, camcal::ImageSize::new(32, 24));

    // The stub solver reproduces the detections exactly.
    assert_relative_eq!(calibration.lens_model.mean_accuracy, 100.0, epsilon = 1e-9);
    for e in calibration.per_image_error {
        assert_relative_eq!(e, 0.0, epsilon = 1e-9);
    }
}

#[test]
fn stops_once_target_is_reached() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 20);
    let detector = StubDetector::new(0..20);
    let solver = CalibrationSolver::new(config(4), &detector, StubSolver);

    let (set, attempts) = solver.collect(dir.path()).unwrap();
    assert_eq!(set.len(), 4);
    assert_eq!(attempts, 4);
    assert_eq!(detector.calls(), 4);
}

#[test]
fn no_detection_is_insufficient_and_writes_nothing() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 10);
    let detector = StubDetector::new([]);
    let solver = CalibrationSolver::new(config(4), &detector, StubSolver);

    let result = solver.calibrate_and_save(dir.path(), "test");
    assert!(matches!(
        result,
        Err(Error::InsufficientCalibrationData { attempts: 10 })
    ));
    assert!(!dir.path().join(PARAMS_FILE_NAME).exists());
}

#[test]
fn attempt_budget_bounds_sampling_with_replacement() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 3);
    let detector = StubDetector::new([]);
    let mut cfg = config(2);
    cfg.strategy = SelectionStrategy::WithReplacement;
    let solver = CalibrationSolver::new(cfg, &detector, StubSolver);

    assert!(matches!(
        solver.collect(dir.path()),
        Err(Error::InsufficientCalibrationData { attempts: 8 })
    ));
    assert_eq!(detector.calls(), 8);
}

#[test]
fn exhaustive_selection_is_in_name_order() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 6);
    let detector = StubDetector::new([2, 4, 5]);
    let mut cfg = config(2);
    cfg.strategy = SelectionStrategy::Exhaustive;
    let solver = CalibrationSolver::new(cfg, &detector, StubSolver);

    let (set, attempts) = solver.collect(dir.path()).unwrap();
    let names: Vec<_> = set
        .views
        .iter()
        .map(|v| v.source.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["image_2.png", "image_4.png"]);
    assert_eq!(attempts, 5);
}

#[test]
fn saved_model_reloads_identically() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 4);
    let detector = StubDetector::new(0..4);
    let solver = CalibrationSolver::new(config(2), &detector, StubSolver);

    let (calibration, params_file) = solver.calibrate_and_save(dir.path(), "test").unwrap();
    let loaded = LensModel::load(&params_file).unwrap();
    assert_eq!(loaded, calibration.lens_model);
    assert_eq!(loaded.camera_matrix(), camera_matrix());
}

#[test]
fn missing_directory_fails_before_detection() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let detector = StubDetector::new([0]);
    let solver = CalibrationSolver::new(config(2), &detector, StubSolver);
    assert!(matches!(
        solver.calibrate(&dir.path().join("missing")),
        Err(Error::SourceDirectory { .. })
    ));
    assert_eq!(detector.calls(), 0);
}

#[test]
fn empty_directory_has_no_candidates() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let detector = StubDetector::new([0]);
    let solver = CalibrationSolver::new(config(2), &detector, StubSolver);
    assert!(matches!(
        solver.calibrate(dir.path()),
        Err(Error::NoCandidateImages(_))
    ));
}

#[test]
fn minority_image_sizes_are_skipped() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 3);
    // Same index encoding, different size. Sorts before image_0.png.
    image::GrayImage::from_pixel(16, 16, image::Luma([10]))
        .save(dir.path().join("a_small.png"))
        .unwrap();
    let detector = StubDetector::new([0, 1, 2]);
    let mut cfg = config(4);
    cfg.strategy = SelectionStrategy::Exhaustive;
    let solver = CalibrationSolver::new(cfg, &detector, StubSolver);

    let (set, attempts) = solver.collect(dir.path()).unwrap();
    assert_eq!(set.len(), 3);
    assert_eq!(set.image_size, camcal::ImageSize::new(32, 24));
    assert_eq!(attempts, 3);
    assert_eq!(detector.calls(), 3);
}

#[test]
fn preview_next_to_captures_is_never_a_candidate() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    write_images(dir.path(), 4);
    image::GrayImage::from_pixel(854, 320, image::Luma([10]))
        .save(dir.path().join(camcal::PREVIEW_FILE_NAME))
        .unwrap();
    assert_eq!(camcal::list_candidate_images(dir.path()).unwrap().len(), 4);

    let detector = StubDetector::new(0..4);
    for strategy in [
        SelectionStrategy::WithoutReplacement,
        SelectionStrategy::WithReplacement,
        SelectionStrategy::Exhaustive,
    ] {
        for seed in 0..16 {
            let mut cfg = config(4);
            cfg.strategy = strategy;
            cfg.seed = Some(seed);
            let solver = CalibrationSolver::new(cfg, &detector, StubSolver);
            let (set, _) = solver.collect(dir.path()).unwrap();
            assert_eq!(set.image_size, camcal::ImageSize::new(32, 24));
            assert!(!set.is_empty());
            assert!(
                set.views
                    .iter()
                    .all(|v| v.source.file_name().unwrap() != camcal::PREVIEW_FILE_NAME)
            );
        }
    }
}
