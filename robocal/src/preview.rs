use std::path::{Path, PathBuf};

use image::{RgbImage, imageops::FilterType};
use undistort_image::UndistortOperator;

pub use camcal::PREVIEW_FILE_NAME;

pub const PREVIEW_HEIGHT: u32 = 320;

fn scale_to_height(img: &RgbImage, height: u32) -> RgbImage {
    let width = ((img.width() as f64 * height as f64 / img.height() as f64).round() as u32).max(1);
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

/// Place `before` and `after` next to each other, both scaled to `height`.
pub fn side_by_side(before: &RgbImage, after: &RgbImage, height: u32) -> RgbImage {
    let left = scale_to_height(before, height);
    let right = scale_to_height(after, height);
    let mut canvas = RgbImage::new(left.width() + right.width(), height);
    image::imageops::replace(&mut canvas, &left, 0, 0);
    image::imageops::replace(&mut canvas, &right, left.width() as i64, 0);
    canvas
}

/// Undistort `source` and write the before/after pair to `preview.png` in
/// `dir`.
pub fn write_preview(
    dir: &Path,
    source: &Path,
    operator: &UndistortOperator,
) -> eyre::Result<PathBuf> {
    use eyre::WrapErr;

    let before = image::open(source)
        .with_context(|| format!("reading \"{}\"", source.display()))?
        .to_rgb8();
    let after = operator.undistort(&before)?;
    let preview = side_by_side(&before, &after, PREVIEW_HEIGHT);
    let path = dir.join(PREVIEW_FILE_NAME);
    preview
        .save(&path)
        .with_context(|| format!("writing \"{}\"", path.display()))?;
    tracing::info!("preview written to \"{}\"", path.display());
    Ok(path)
}
