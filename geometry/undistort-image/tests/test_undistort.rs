use std::sync::Arc;

use camcal::{ImageSize, LensModel, SolvedLens};
use nalgebra::{Matrix3, Vector5};
use robocam::FramePreprocessor;
use test_log::test;
use undistort_image::UndistortOperator;

fn model(distortion: Vector5<f64>) -> LensModel {
    let solved = SolvedLens {
        camera_matrix: Matrix3::new(60.0, 0.0, 31.5, 0.0, 60.0, 23.5, 0.0, 0.0, 1.0),
        distortion,
        poses: vec![],
    };
    LensModel::from_solved(&solved, ImageSize::new(64, 48), 1.0, 100.0).unwrap()
}

fn gradient(width: u32, height: u32) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 3) as u8, (y * 4) as u8, 100])
    })
}

#[test]
fn zero_distortion_is_identity_inside_the_frame() {
    let op = UndistortOperator::new(model(Vector5::zeros()));
    let input = gradient(64, 48);
    let output = op.undistort(&input).unwrap();
    assert_eq!(output.dimensions(), input.dimensions());
    for y in 1..47 {
        for x in 1..63 {
            let a = input.get_pixel(x, y).0;
            let b = output.get_pixel(x, y).0;
            for c in 0..3 {
                assert!(
                    (a[c] as i32 - b[c] as i32).abs() <= 1,
                    "pixel ({x},{y}) channel {c}: {} vs {}",
                    a[c],
                    b[c]
                );
            }
        }
    }
}

#[test]
fn output_size_matches_input_for_other_sizes() {
    let op = UndistortOperator::new(model(Vector5::new(-0.2, 0.03, 0.0, 0.0, 0.0)));
    for (w, h) in [(64, 48), (32, 24), (80, 40)] {
        let out = op.undistort(&gradient(w, h)).unwrap();
        assert_eq!(out.dimensions(), (w, h));
    }
    assert_eq!(op.cached_sizes(), 3);
    op.undistort(&gradient(32, 24)).unwrap();
    assert_eq!(op.cached_sizes(), 3);
}

#[test]
fn barrel_distortion_changes_the_image() {
    let op = UndistortOperator::new(model(Vector5::new(-0.3, 0.05, 0.0, 0.0, 0.0)));
    let input = gradient(64, 48);
    let output = op.undistort(&input).unwrap();
    assert_ne!(output.as_raw(), input.as_raw());
}

#[test]
fn works_as_a_frame_preprocessor() {
    let op = UndistortOperator::new(model(Vector5::zeros()));
    let frame = Arc::new(robocam::Frame::new(gradient(64, 48), 7));
    let out = op.process(frame.clone()).unwrap();
    assert_eq!(out.host_timing.fno, 7);
    assert_eq!((out.width(), out.height()), (64, 48));
}

#[test]
fn loads_from_params_file() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let path = model(Vector5::zeros())
        .save(dir.path(), "test", chrono::Local::now())
        .unwrap();
    let op = UndistortOperator::from_file(&path).unwrap();
    assert_eq!(op.model().image_size, ImageSize::new(64, 48));
}

#[test]
fn invalid_params_file_is_rejected() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let path = dir.path().join("params.yaml");
    std::fs::write(&path, "mean_accuracy: 99.0\n").unwrap();
    assert!(matches!(
        UndistortOperator::from_file(&path),
        Err(camcal::Error::InvalidLensModel { .. })
    ));
}
