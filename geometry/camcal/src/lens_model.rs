use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, RowVector2, Vector5};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, ImageSize, Result, SolvedLens};

/// Name of the lens model file inside a calibration directory.
pub const PARAMS_FILE_NAME: &str = "params.yaml";

/// A solved lens, as persisted after a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensModel {
    /// Intrinsic matrix, row major.
    pub camera_matrix: [[f64; 3]; 3],
    /// `k1, k2, p1, p2[, k3]`
    pub distortion_coeffs: Vec<f64>,
    /// Size of the images the model was fit against.
    pub image_size: ImageSize,
    /// Intrinsic matrix to undistort into at `image_size`.
    pub optimal_camera_matrix: [[f64; 3]; 3],
    pub mean_accuracy: f64,
}

fn to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

fn from_rows(r: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
    )
}

impl LensModel {
    pub fn from_solved(
        solved: &SolvedLens,
        image_size: ImageSize,
        alpha: f64,
        mean_accuracy: f64,
    ) -> Result<Self> {
        let optimal =
            optimal_new_camera_matrix(&solved.camera_matrix, &solved.distortion, image_size, alpha)?;
        Ok(Self {
            camera_matrix: to_rows(&solved.camera_matrix),
            distortion_coeffs: solved.distortion.iter().copied().collect(),
            image_size,
            optimal_camera_matrix: to_rows(&optimal),
            mean_accuracy,
        })
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        from_rows(&self.camera_matrix)
    }

    pub fn optimal_camera_matrix(&self) -> Matrix3<f64> {
        from_rows(&self.optimal_camera_matrix)
    }

    /// Distortion as `(k1, k2, p1, p2, k3)`, with `k3 = 0` for 4-term models.
    pub fn distortion(&self) -> Vector5<f64> {
        let mut d = Vector5::zeros();
        for (dst, src) in d.iter_mut().zip(self.distortion_coeffs.iter()) {
            *dst = *src;
        }
        d
    }

    /// The optimal matrix for frames of `size`.
    ///
    /// The stored matrix is reused when `size` equals the calibrated size.
    pub fn optimal_camera_matrix_for(&self, size: ImageSize, alpha: f64) -> Result<Matrix3<f64>> {
        if size == self.image_size {
            Ok(self.optimal_camera_matrix())
        } else {
            optimal_new_camera_matrix(&self.camera_matrix(), &self.distortion(), size, alpha)
        }
    }

    /// Intrinsics which map pixels in `new_camera_matrix` coordinates to
    /// pixels in the distorted source image via
    /// [RosOpenCvIntrinsics::distort].
    pub fn undistortion_intrinsics(
        &self,
        new_camera_matrix: &Matrix3<f64>,
    ) -> Result<RosOpenCvIntrinsics<f64>> {
        let mut p = nalgebra::Matrix3x4::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(new_camera_matrix);
        let distortion = Distortion::from_opencv_vec(self.distortion());
        RosOpenCvIntrinsics::from_components(p, self.camera_matrix(), distortion, Matrix3::identity())
            .map_err(|e| Error::InvalidLensModel {
                source_name: "lens model".into(),
                reason: format!("{e:?}"),
            })
    }

    /// Check that the values describe a usable lens.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let k = self.camera_matrix();
        if !k.iter().all(|v| v.is_finite()) {
            return Err("camera_matrix has non-finite entries".into());
        }
        if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
            return Err("camera_matrix focal lengths must be positive".into());
        }
        if !self.optimal_camera_matrix().iter().all(|v| v.is_finite()) {
            return Err("optimal_camera_matrix has non-finite entries".into());
        }
        if !matches!(self.distortion_coeffs.len(), 4 | 5) {
            return Err(format!(
                "expected 4 or 5 distortion_coeffs, found {}",
                self.distortion_coeffs.len()
            ));
        }
        if !self.distortion_coeffs.iter().all(|v| v.is_finite()) {
            return Err("distortion_coeffs has non-finite entries".into());
        }
        if self.image_size.width == 0 || self.image_size.height == 0 {
            return Err(format!("image_size {} is empty", self.image_size));
        }
        Ok(())
    }

    /// Parse and validate a model. `source_name` is used in error messages.
    pub fn from_yaml_str(yaml: &str, source_name: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidLensModel {
            source_name: source_name.to_string(),
            reason,
        };
        let model: Self = serde_yaml::from_str(yaml).map_err(|e| invalid(e.to_string()))?;
        model.validate().map_err(invalid)?;
        Ok(model)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml, &path.display().to_string())
    }

    /// Write the model into `dirname`.
    ///
    /// A timestamped copy `params.YYYYMMDD_HHMMSS.yaml` is written first and
    /// then copied to [PARAMS_FILE_NAME], overwriting any existing file.
    /// Returns the path of the latter.
    pub fn save(
        &self,
        dirname: &Path,
        pkg_name: &str,
        local: chrono::DateTime<chrono::Local>,
    ) -> Result<PathBuf> {
        let stamped = dirname.join(local.format("params.%Y%m%d_%H%M%S.yaml").to_string());
        let mut f = std::fs::File::create(&stamped)?;
        std::io::Write::write_all(
            &mut f,
            format!(
                "# Saved by {} at {}\n\
                 # Mean accuracy: {:.2}\n",
                pkg_name, local, self.mean_accuracy
            )
            .as_bytes(),
        )?;
        serde_yaml::to_writer(f, self)?;

        let params_file = dirname.join(PARAMS_FILE_NAME);
        std::fs::copy(&stamped, &params_file)?;
        info!("Camera params saved to {}", params_file.display());
        Ok(params_file)
    }
}

/// Intrinsic matrix for undistorting images of `size` so that, with
/// `alpha = 1`, every source pixel remains visible and, with `alpha = 0`,
/// only valid pixels are shown.
///
/// Samples a 9x9 grid over the image, undistorts it to normalized
/// coordinates and fits the inscribed and circumscribed rectangles to the
/// output viewport.
pub fn optimal_new_camera_matrix(
    camera_matrix: &Matrix3<f64>,
    distortion: &Vector5<f64>,
    size: ImageSize,
    alpha: f64,
) -> Result<Matrix3<f64>> {
    const N: usize = 9;

    let k = camera_matrix;
    let (fx, skew, fy, cx, cy) = (k[(0, 0)], k[(0, 1)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    let intrinsics = RosOpenCvIntrinsics::from_params_with_distortion(
        fx,
        skew,
        fy,
        cx,
        cy,
        Distortion::from_opencv_vec(*distortion),
    );

    let (w, h) = (size.width as f64, size.height as f64);
    let mut outer = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    let mut inner = [f64::MIN, f64::MIN, f64::MAX, f64::MAX];
    for i in 0..N {
        for j in 0..N {
            let px = j as f64 * (w - 1.0) / (N - 1) as f64;
            let py = i as f64 * (h - 1.0) / (N - 1) as f64;
            let undist = intrinsics
                .undistort(&cam_geom::Pixels {
                    data: RowVector2::new(px, py),
                })
                .data;
            let yn = (undist[(0, 1)] - cy) / fy;
            let xn = (undist[(0, 0)] - cx - skew * yn) / fx;

            outer[0] = outer[0].min(xn);
            outer[1] = outer[1].min(yn);
            outer[2] = outer[2].max(xn);
            outer[3] = outer[3].max(yn);
            if j == 0 {
                inner[0] = inner[0].max(xn);
            }
            if j == N - 1 {
                inner[2] = inner[2].min(xn);
            }
            if i == 0 {
                inner[1] = inner[1].max(yn);
            }
            if i == N - 1 {
                inner[3] = inner[3].min(yn);
            }
        }
    }

    let fit = |rect: &[f64; 4]| {
        let fx = (w - 1.0) / (rect[2] - rect[0]);
        let fy = (h - 1.0) / (rect[3] - rect[1]);
        (fx, fy, -fx * rect[0], -fy * rect[1])
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);
    let mix = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;

    let result = Matrix3::new(
        mix(fx0, fx1),
        0.0,
        mix(cx0, cx1),
        0.0,
        mix(fy0, fy1),
        mix(cy0, cy1),
        0.0,
        0.0,
        1.0,
    );
    if !result.iter().all(|v| v.is_finite()) {
        return Err(Error::Backend(format!(
            "degenerate lens model: cannot fit an undistorted viewport for {size}"
        )));
    }
    Ok(result)
}
