//! Visual normalization.
//!
//! Capabilities may return images of any size. Every visual entering
//! composition must match the output resolution, so images that differ are
//! scaled to fit and letterboxed onto a black canvas of the target size.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};
use sc_core::VisualArtifact;

/// Bring `artifact` to exactly `width` x `height`.
///
/// Returns the artifact unchanged when it already matches. Otherwise writes
/// `<stem>_normalized.png` next to the original and returns that.
pub fn normalize_visual(
    artifact: &VisualArtifact,
    width: u32,
    height: u32,
) -> sc_core::Result<VisualArtifact> {
    let img = image::open(&artifact.path).map_err(|e| {
        sc_core::Error::Validation(format!(
            "cannot decode visual {}: {e}",
            artifact.path.display()
        ))
    })?;

    let (w, h) = img.dimensions();
    if (w, h) == (width, height) {
        return Ok(VisualArtifact {
            path: artifact.path.clone(),
            width,
            height,
        });
    }

    tracing::debug!(
        "normalizing visual {} from {w}x{h} to {width}x{height}",
        artifact.path.display()
    );

    // `resize` preserves aspect ratio and fits within the bounds.
    let fitted = img.resize(width, height, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
    let x = (width - fitted.width()) / 2;
    let y = (height - fitted.height()) / 2;
    image::imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));

    let dest = normalized_path(&artifact.path);
    canvas
        .save_with_format(&dest, ImageFormat::Png)
        .map_err(|e| sc_core::Error::tool("image", format!("failed to write {}: {e}", dest.display())))?;

    Ok(VisualArtifact {
        path: dest,
        width,
        height,
    })
}

/// Describe an image file produced outside the pipeline.
pub fn visual_artifact(path: impl Into<PathBuf>) -> sc_core::Result<VisualArtifact> {
    let path = path.into();
    let (width, height) = image::image_dimensions(&path).map_err(|e| {
        sc_core::Error::Validation(format!("cannot read visual {}: {e}", path.display()))
    })?;
    Ok(VisualArtifact {
        path,
        width,
        height,
    })
}

fn normalized_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "visual".into());
    path.with_file_name(format!("{stem}_normalized.png"))
}
