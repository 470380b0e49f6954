use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{Error, ImageSize, Result};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

/// Name of the before/after preview image written next to the captures.
/// Never a calibration candidate.
pub const PREVIEW_FILE_NAME: &str = "preview.png";

fn is_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case(PREVIEW_FILE_NAME))
}

/// List the image files in `dirname` that may contain a calibration target.
///
/// Extensions are matched case-insensitively. The preview image is left
/// out. The result is sorted by path.
pub fn list_candidate_images(dirname: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(dirname).map_err(|e| Error::SourceDirectory {
        path: dirname.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(Error::SourceDirectory {
            path: dirname.to_path_buf(),
            reason: "not a directory".into(),
        });
    }
    let dir_str = dirname.to_str().ok_or_else(|| Error::SourceDirectory {
        path: dirname.to_path_buf(),
        reason: "path is not valid UTF-8".into(),
    })?;
    let escaped = glob::Pattern::escape(dir_str);

    let mut paths = vec![];
    for ext in EXTENSIONS {
        let pattern = format!("{escaped}/*.{ext}");
        for path in glob::glob_with(
            &pattern,
            glob::MatchOptions {
                case_sensitive: false,
                require_literal_separator: true,
                require_literal_leading_dot: true,
            },
        )? {
            match path {
                Ok(path) if path.is_file() && !is_artifact(&path) => paths.push(path),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable entry: {e}"),
            }
        }
    }

    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Keep only the candidates of the most common image size.
///
/// Sizes are read from the file headers. Ties go to the size that appears
/// first in `paths`. Unreadable files and files of any other size are
/// dropped with a warning. Returns `None` if no file could be read.
pub fn filter_to_common_size(paths: Vec<PathBuf>) -> Option<(ImageSize, Vec<PathBuf>)> {
    let mut sized = Vec::with_capacity(paths.len());
    for path in paths {
        match image::image_dimensions(&path) {
            Ok((width, height)) => sized.push((path, ImageSize::new(width, height))),
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }

    let mut counts: Vec<(ImageSize, usize)> = Vec::new();
    for (_, size) in sized.iter() {
        match counts.iter_mut().find(|(s, _)| s == size) {
            Some((_, n)) => *n += 1,
            None => counts.push((*size, 1)),
        }
    }
    // `max_by_key` keeps the last maximum, so search from the back.
    let (common, _) = counts.iter().rev().max_by_key(|(_, n)| *n).copied()?;

    let mut kept = Vec::with_capacity(sized.len());
    for (path, size) in sized {
        if size == common {
            kept.push(path);
        } else {
            let e = Error::ImageSizeMismatch {
                path,
                actual: size,
                expected: common,
            };
            warn!("skipping: {e}");
        }
    }
    Some((common, kept))
}
