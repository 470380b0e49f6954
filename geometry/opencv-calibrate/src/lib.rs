mod ffi;

use std::os::raw::{c_int, c_void};

#[derive(Debug)]
pub enum Error {
    CvError,
    GenericError,
    InvalidInput(&'static str),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ffi::cv_return_value_double> for Result<f64, Error> {
    fn from(orig: ffi::cv_return_value_double) -> Result<f64, Error> {
        if orig.is_cv_exception != 0 {
            Err(Error::CvError)
        } else if orig.is_other_exception != 0 {
            Err(Error::GenericError)
        } else {
            Ok(orig.result)
        }
    }
}

impl From<ffi::cv_return_value_bool> for Result<bool, Error> {
    fn from(orig: ffi::cv_return_value_bool) -> Result<bool, Error> {
        if orig.is_cv_exception != 0 {
            Err(Error::CvError)
        } else if orig.is_other_exception != 0 {
            Err(Error::GenericError)
        } else {
            Ok(orig.result)
        }
    }
}

struct SliceData {
    ptr: *mut c_void,
    num_elements: usize,
}

impl From<ffi::cv_return_value_slice> for Result<SliceData, Error> {
    fn from(orig: ffi::cv_return_value_slice) -> Result<SliceData, Error> {
        if orig.is_cv_exception != 0 {
            Err(Error::CvError)
        } else if orig.is_other_exception != 0 {
            Err(Error::GenericError)
        } else {
            Ok(SliceData {
                ptr: orig.ptr,
                num_elements: orig.num_elements as usize,
            })
        }
    }
}

#[derive(Debug)]
pub struct CalibrationResult {
    /// RMS reprojection error reported by OpenCV
    pub mean_reprojection_error: f64,
    /// camera calibration matrix, row major order
    pub camera_matrix: [f64; 9],
    /// non-linear distortion coefficients (k1, k2, p1, p2, k3)
    pub distortion_coeffs: [f64; 5],
    /// rotation matrices, row major order
    pub rotation_matrices: Vec<[f64; 9]>,
    /// translation vectors
    pub translation_vectors: Vec<[f64; 3]>,
}

/// A point with a view in image (2D) and world (3D)
#[derive(Debug)]
pub struct CorrespondingPoint {
    pub object_point: (f64, f64, f64),
    pub image_point: (f64, f64),
}

pub fn calibrate_camera(
    all_pts: &[Vec<CorrespondingPoint>],
    width: i32,
    height: i32,
) -> Result<CalibrationResult, Error> {
    if all_pts.is_empty() {
        return Err(Error::InvalidInput("no views to calibrate from"));
    }
    let point_counts: Vec<i32> = all_pts
        .iter()
        .map(|image_pts| image_pts.len() as i32)
        .collect();
    let flat_all_pts: Vec<&CorrespondingPoint> = all_pts.iter().flatten().collect();
    let total = flat_all_pts.len();

    let mut object_points = Vec::with_capacity(total * 3);
    let mut image_points = Vec::with_capacity(total * 2);

    for pt in flat_all_pts.iter() {
        object_points.push(pt.object_point.0);
        object_points.push(pt.object_point.1);
        object_points.push(pt.object_point.2);
        image_points.push(pt.image_point.0);
        image_points.push(pt.image_point.1);
    }
    let num_images = point_counts.len();
    debug_assert!(total * 3 == object_points.len());
    debug_assert!(total * 2 == image_points.len());

    let mut camera_matrix = [0.0; 9];
    camera_matrix[0] = 1.0;
    camera_matrix[4] = 1.0;
    camera_matrix[8] = 1.0;
    let mut distortion_coeffs = [0.0; 5];

    let mut rotation_matrices: Vec<[f64; 9]> = (0..num_images).map(|_| [0.0; 9]).collect();
    let mut translation_vectors: Vec<[f64; 3]> = (0..num_images).map(|_| [0.0; 3]).collect();

    let r1: Result<f64, Error> = unsafe {
        ffi::calibrate_camera(
            num_images as i32,
            object_points.as_ptr(),
            image_points.as_ptr(),
            point_counts.as_ptr(),
            width,
            height,
            camera_matrix.as_mut_ptr(),
            distortion_coeffs.as_mut_ptr(),
            rotation_matrices.as_mut_ptr() as *mut f64,
            translation_vectors.as_mut_ptr() as *mut f64,
        )
    }
    .into();
    let mean_reprojection_error = r1?;

    debug_assert!(rotation_matrices.len() == all_pts.len());
    debug_assert!(translation_vectors.len() == all_pts.len());
    Ok(CalibrationResult {
        mean_reprojection_error,
        camera_matrix,
        distortion_coeffs,
        rotation_matrices,
        translation_vectors,
    })
}

struct VecPoint2f {
    inner: *mut c_void,
}

impl VecPoint2f {
    fn new() -> Self {
        let inner = unsafe { ffi::vec_point2f_new() };
        Self { inner }
    }

    fn to_vec(&self) -> Result<Vec<(f32, f32)>, Error> {
        let data: Result<SliceData, Error> = unsafe { ffi::vec_point2f_slice(self.inner) }.into();
        let data = data?;
        if data.num_elements == 0 {
            return Ok(vec![]);
        }
        // cv::Point2f is two packed floats.
        let flat =
            unsafe { std::slice::from_raw_parts(data.ptr as *const f32, data.num_elements * 2) };
        Ok(flat.chunks_exact(2).map(|xy| (xy[0], xy[1])).collect())
    }

    fn inner(&mut self) -> *mut c_void {
        self.inner
    }
}

impl Drop for VecPoint2f {
    fn drop(&mut self) {
        unsafe { ffi::vec_point2f_delete(self.inner) }
    }
}

fn check_mono(mono_data: &[u8], im_width: u32, im_height: u32) -> Result<(), Error> {
    if mono_data.len() < im_width as usize * im_height as usize {
        return Err(Error::InvalidInput("image buffer smaller than width*height"));
    }
    Ok(())
}

/// Find the inner corners of a chessboard in a tightly packed 8-bit
/// monochrome image.
///
/// Returns `Ok(None)` if the full pattern was not found.
pub fn find_chessboard_corners(
    mono_data: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
) -> Result<Option<Vec<(f32, f32)>>, Error> {
    check_mono(mono_data, im_width, im_height)?;
    let mut corners = VecPoint2f::new();
    let r1: Result<bool, Error> = unsafe {
        ffi::find_chessboard_corners_mono(
            mono_data.as_ptr(),
            im_width as c_int,
            im_height as c_int,
            pattern_width as c_int,
            pattern_height as c_int,
            corners.inner(),
        )
    }
    .into();
    let success: bool = r1?;
    if success {
        Ok(Some(corners.to_vec()?))
    } else {
        Ok(None)
    }
}

/// Refine corner locations in place.
///
/// `window` is the half size of the search window, so `(11, 11)` searches
/// a 23x23 neighbourhood. Iteration stops after
/// `max_iterations` or when a corner moves less than `epsilon`.
pub fn corner_sub_pix(
    mono_data: &[u8],
    im_width: u32,
    im_height: u32,
    corners: &mut [(f32, f32)],
    window: (u32, u32),
    max_iterations: u32,
    epsilon: f64,
) -> Result<(), Error> {
    check_mono(mono_data, im_width, im_height)?;
    if corners.is_empty() {
        return Ok(());
    }
    let mut flat: Vec<f32> = corners.iter().flat_map(|&(x, y)| [x, y]).collect();
    let r1: Result<bool, Error> = unsafe {
        ffi::corner_sub_pix_mono(
            mono_data.as_ptr(),
            im_width as c_int,
            im_height as c_int,
            corners.len() as c_int,
            flat.as_mut_ptr(),
            window.0 as c_int,
            window.1 as c_int,
            max_iterations as c_int,
            epsilon,
        )
    }
    .into();
    r1?;
    for (dst, xy) in corners.iter_mut().zip(flat.chunks_exact(2)) {
        *dst = (xy[0], xy[1]);
    }
    Ok(())
}

#[test]
fn test_linking() {
    let mono = vec![128u8; 64 * 48];
    let result = find_chessboard_corners(&mono, 64, 48, 3, 3).unwrap();
    assert!(result.is_none());
}

#[test]
fn test_short_buffer_rejected() {
    let mono = [0u8; 3];
    assert!(matches!(
        find_chessboard_corners(&mono, 4, 5, 3, 3),
        Err(Error::InvalidInput(_))
    ));
}
