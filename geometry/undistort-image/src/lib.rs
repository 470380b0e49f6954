//! Remove lens distortion from images using a persisted [camcal::LensModel].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use camcal::{ImageSize, LensModel};
use opencv_ros_camera::RosOpenCvIntrinsics;
use parking_lot::Mutex;
use tracing::debug;

/// Per-pixel source coordinates for one output size.
#[derive(Clone)]
pub struct UndistortionCache {
    mapx: kornia_tensor::CpuTensor2<f32>,
    mapy: kornia_tensor::CpuTensor2<f32>,
    width: usize,
    height: usize,
}

impl UndistortionCache {
    /// `intrinsics` must map undistorted output pixels to distorted source
    /// pixels, see [LensModel::undistortion_intrinsics].
    pub fn new(
        intrinsics: &RosOpenCvIntrinsics<f64>,
        width: usize,
        height: usize,
    ) -> eyre::Result<Self> {
        use kornia_imgproc::interpolation::grid::meshgrid_from_fn;

        let (mapx, mapy) = meshgrid_from_fn(width, height, |u, v| {
            let undist = opencv_ros_camera::UndistortedPixels {
                data: nalgebra::RowVector2::<f64>::new(u as f64, v as f64),
            };
            let dist = intrinsics.distort(&undist).data;
            Ok((dist[(0, 0)] as f32, dist[(0, 1)] as f32))
        })
        .map_err(|e| eyre::eyre!("{e:?}"))?;

        Ok(Self {
            mapx,
            mapy,
            width,
            height,
        })
    }
}

pub fn undistort_image(
    decoded: &image::RgbImage,
    undist_cache: &UndistortionCache,
) -> eyre::Result<image::RgbImage> {
    let width = decoded.width() as usize;
    let height = decoded.height() as usize;
    if (width, height) != (undist_cache.width, undist_cache.height) {
        eyre::bail!(
            "image is {width}x{height} but remap tables are {}x{}",
            undist_cache.width,
            undist_cache.height
        );
    }

    let data_f32: Vec<f32> = decoded.as_raw().iter().map(|x| *x as f32).collect();
    let image = kornia_image::image::Image::<f32, 3>::new(
        kornia_image::image::ImageSize { width, height },
        data_f32,
    )?;
    let mut undistorted_img = kornia_image::image::Image::<f32, 3>::from_size_val(
        kornia_image::image::ImageSize { width, height },
        0.0,
    )?;
    kornia_imgproc::interpolation::remap(
        &image,
        &mut undistorted_img,
        &undist_cache.mapx,
        &undist_cache.mapy,
        kornia_imgproc::interpolation::InterpolationMode::Bilinear,
    )?;
    let tensor: kornia_tensor::Tensor<f32, 3, _> = undistorted_img.0;
    if tensor.shape[2] != 3 {
        eyre::bail!("expected exactly 3 channels");
    }
    let data_u8: Vec<u8> = tensor
        .into_vec()
        .into_iter()
        .map(|x| x.round() as u8)
        .collect();
    image::RgbImage::from_raw(width as u32, height as u32, data_u8)
        .ok_or_else(|| eyre::eyre!("unexpected output image size"))
}

/// Applies one lens model to frames of any size.
///
/// Remap tables are built on first use for each frame size and reused
/// afterwards. For frames of the calibrated size the stored optimal camera
/// matrix is used; other sizes get one computed for them.
pub struct UndistortOperator {
    model: LensModel,
    alpha: f64,
    caches: Mutex<HashMap<ImageSize, Arc<UndistortionCache>>>,
}

impl UndistortOperator {
    pub fn new(model: LensModel) -> Self {
        Self {
            model,
            alpha: 1.0,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Load the model from a `params.yaml` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> camcal::Result<Self> {
        Ok(Self::new(LensModel::load(path)?))
    }

    /// Free scaling parameter used for frame sizes other than the
    /// calibrated one.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn model(&self) -> &LensModel {
        &self.model
    }

    /// Number of frame sizes with remap tables built.
    pub fn cached_sizes(&self) -> usize {
        self.caches.lock().len()
    }

    fn cache_for(&self, size: ImageSize) -> eyre::Result<Arc<UndistortionCache>> {
        if let Some(cache) = self.caches.lock().get(&size) {
            return Ok(cache.clone());
        }
        debug!("building remap tables for {size}");
        let new_k = self.model.optimal_camera_matrix_for(size, self.alpha)?;
        let intrinsics = self.model.undistortion_intrinsics(&new_k)?;
        let cache = Arc::new(UndistortionCache::new(
            &intrinsics,
            size.width as usize,
            size.height as usize,
        )?);
        self.caches.lock().insert(size, cache.clone());
        Ok(cache)
    }

    /// Undistort `img`. The output has the same size as the input.
    pub fn undistort(&self, img: &image::RgbImage) -> eyre::Result<image::RgbImage> {
        let cache = self.cache_for(ImageSize::new(img.width(), img.height()))?;
        undistort_image(img, &cache)
    }
}

impl robocam::FramePreprocessor for UndistortOperator {
    fn process(&self, frame: Arc<robocam::Frame>) -> robocam::Result<Arc<robocam::Frame>> {
        let undistorted = self
            .undistort(&frame.image)
            .map_err(|e| robocam::Error::Preprocess(format!("undistorting: {e:#}")))?;
        Ok(Arc::new(frame.with_image(undistorted)))
    }
}
