use nalgebra::{Matrix3, Rotation3, Vector3, Vector5};
use tracing::debug;

use crate::{
    CalibrationSet, Coords2D, Error, LensSolver, PatternDetector, PatternGeometry, Pose, Result,
    SolvedLens,
};

const SUBPIX_MAX_ITERATIONS: u32 = 30;
const SUBPIX_EPSILON: f64 = 0.001;

impl From<opencv_calibrate::Error> for Error {
    fn from(orig: opencv_calibrate::Error) -> Error {
        Error::Backend(orig.to_string())
    }
}

/// Chessboard detection with OpenCV.
pub struct OpenCvDetector;

impl PatternDetector for OpenCvDetector {
    fn find_corners(
        &self,
        image: &image::GrayImage,
        pattern: &PatternGeometry,
    ) -> Result<Option<Vec<Coords2D>>> {
        let corners = opencv_calibrate::find_chessboard_corners(
            image.as_raw(),
            image.width(),
            image.height(),
            pattern.cols,
            pattern.rows,
        )?;
        debug!("    {:?} corners.", corners.as_ref().map(|x| x.len()));
        Ok(corners.map(|c| c.into_iter().map(|(x, y)| (x as f64, y as f64)).collect()))
    }

    fn refine_corners(
        &self,
        image: &image::GrayImage,
        corners: Vec<Coords2D>,
        window: (u32, u32),
    ) -> Result<Vec<Coords2D>> {
        let mut pts: Vec<(f32, f32)> = corners.iter().map(|&(x, y)| (x as f32, y as f32)).collect();
        opencv_calibrate::corner_sub_pix(
            image.as_raw(),
            image.width(),
            image.height(),
            &mut pts,
            window,
            SUBPIX_MAX_ITERATIONS,
            SUBPIX_EPSILON,
        )?;
        Ok(pts.into_iter().map(|(x, y)| (x as f64, y as f64)).collect())
    }
}

/// `cv::calibrateCamera`
pub struct OpenCvSolver;

impl LensSolver for OpenCvSolver {
    fn solve(&self, set: &CalibrationSet) -> Result<SolvedLens> {
        use opencv_calibrate::CorrespondingPoint;
        let pts: Vec<Vec<CorrespondingPoint>> = set
            .views
            .iter()
            .map(|view| {
                view.object_points
                    .iter()
                    .zip(view.image_points.iter())
                    .map(|(obj_pt, im_pt)| CorrespondingPoint {
                        object_point: *obj_pt,
                        image_point: *im_pt,
                    })
                    .collect()
            })
            .collect();

        let raw = opencv_calibrate::calibrate_camera(
            &pts,
            set.image_size.width as i32,
            set.image_size.height as i32,
        )?;
        debug!(
            "OpenCV RMS reprojection error: {}",
            raw.mean_reprojection_error
        );

        let poses = raw
            .rotation_matrices
            .iter()
            .zip(raw.translation_vectors.iter())
            .map(|(r, t)| Pose {
                rotation: Rotation3::from_matrix_unchecked(Matrix3::from_row_slice(r)),
                translation: Vector3::from_row_slice(t),
            })
            .collect();

        Ok(SolvedLens {
            camera_matrix: Matrix3::from_row_slice(&raw.camera_matrix),
            distortion: Vector5::from_row_slice(&raw.distortion_coeffs),
            poses,
        })
    }
}
