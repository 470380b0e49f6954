use nalgebra::{Point3, RowVector2};
use opencv_ros_camera::{RosOpenCvIntrinsics, UndistortedPixels};

use crate::{Coords2D, Coords3D, Pose};

/// Project target points through a posed camera, including lens distortion.
pub fn project_points(
    intrinsics: &RosOpenCvIntrinsics<f64>,
    pose: &Pose,
    object_points: &[Coords3D],
) -> Vec<Coords2D> {
    let k = &intrinsics.k;
    object_points
        .iter()
        .map(|&(x, y, z)| {
            let cam = pose.rotation * Point3::new(x, y, z) + pose.translation;
            let (xn, yn) = (cam.x / cam.z, cam.y / cam.z);
            let undist = UndistortedPixels {
                data: RowVector2::new(
                    k[(0, 0)] * xn + k[(0, 1)] * yn + k[(0, 2)],
                    k[(1, 1)] * yn + k[(1, 2)],
                ),
            };
            let dist = intrinsics.distort(&undist).data;
            (dist[(0, 0)], dist[(0, 1)])
        })
        .collect()
}

/// L2 norm of the stacked residuals divided by the number of points.
///
/// Comparable between runs, but not a per-point pixel distance.
pub fn reprojection_error(detected: &[Coords2D], projected: &[Coords2D]) -> f64 {
    debug_assert_eq!(detected.len(), projected.len());
    if projected.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = detected
        .iter()
        .zip(projected)
        .map(|(a, b)| (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2))
        .sum();
    sum_sq.sqrt() / projected.len() as f64
}

/// `100 - 100 * mean(per_image_errors)`.
pub fn mean_accuracy(per_image_errors: &[f64]) -> f64 {
    if per_image_errors.is_empty() {
        return 0.0;
    }
    let mean = per_image_errors.iter().sum::<f64>() / per_image_errors.len() as f64;
    100.0 - 100.0 * mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector5};

    fn pinhole() -> RosOpenCvIntrinsics<f64> {
        let dist = opencv_ros_camera::Distortion::from_opencv_vec(Vector5::zeros());
        RosOpenCvIntrinsics::from_params_with_distortion(100.0, 0.0, 100.0, 320.0, 240.0, dist)
    }

    #[test]
    fn projects_through_pinhole() {
        let pose = Pose::identity_at(Vector3::new(0.0, 0.0, 10.0));
        let pts = project_points(&pinhole(), &pose, &[(0.0, 0.0, 0.0), (1.0, 2.0, 0.0)]);
        assert_relative_eq!(pts[0].0, 320.0, epsilon = 1e-9);
        assert_relative_eq!(pts[0].1, 240.0, epsilon = 1e-9);
        assert_relative_eq!(pts[1].0, 330.0, epsilon = 1e-9);
        assert_relative_eq!(pts[1].1, 260.0, epsilon = 1e-9);
    }

    #[test]
    fn error_is_norm_over_count() {
        let detected = [(0.0, 0.0), (0.0, 0.0)];
        let projected = [(3.0, 4.0), (0.0, 0.0)];
        assert_relative_eq!(reprojection_error(&detected, &projected), 2.5);
    }

    #[test]
    fn accuracy_of_perfect_fit_is_100() {
        assert_relative_eq!(mean_accuracy(&[0.0, 0.0]), 100.0);
        assert_relative_eq!(mean_accuracy(&[0.01, 0.03]), 98.0);
    }
}
