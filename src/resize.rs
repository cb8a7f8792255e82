//! # Resolution Cap
//!
//! Ridimensiona le immagini statiche che superano `max_dimensions` prima dell'encode.
//!
//! ## Caratteristiche
//! - **Solo downscale**: le immagini già nel box non vengono toccate
//! - **Aspect ratio preservato**: il lato più vincolato determina la scala
//! - **Lanczos3**: miglior qualità per il downscaling
//! - **Solo still**: le sequenze animate non vengono ridimensionate

use image::imageops::FilterType;
use image::DynamicImage;
use tracing::debug;

/// Bounding box for still images, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDimensions {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for MaxDimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Target size that fits `(width, height)` inside `max`, or `None` if it already fits.
pub fn fitted_size(width: u32, height: u32, max: MaxDimensions) -> Option<(u32, u32)> {
    if width <= max.width && height <= max.height {
        return None;
    }
    let scale = f64::min(max.width as f64 / width as f64, max.height as f64 / height as f64);
    let fitted_width = ((width as f64 * scale).round() as u32).clamp(1, max.width.max(1));
    let fitted_height = ((height as f64 * scale).round() as u32).clamp(1, max.height.max(1));
    Some((fitted_width, fitted_height))
}

/// Downscales `image` into `max` with Lanczos3. Returns the input untouched when it fits.
pub fn cap_dimensions(image: DynamicImage, max: Option<MaxDimensions>) -> DynamicImage {
    let Some(max) = max else {
        return image;
    };
    match fitted_size(image.width(), image.height(), max) {
        Some((width, height)) => {
            debug!(
                "Downscaling {}x{} -> {}x{} (max {}x{})",
                image.width(),
                image.height(),
                width,
                height,
                max.width,
                max.height
            );
            image.resize_exact(width, height, FilterType::Lanczos3)
        }
        None => image,
    }
}
