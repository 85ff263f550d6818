use crate::core::types::Rect;
use anyhow::{Context, Result};
use image::DynamicImage;

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage> {
    let bytes = bytes.to_vec(); // Clone to move into blocking task
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Crop `region` out of `img`, clamped to the image bounds.
///
/// Returns `None` when nothing of the region lies inside the image.
pub fn crop_region(img: &DynamicImage, region: &Rect) -> Option<DynamicImage> {
    let [x1, y1, x2, y2] = region.clamp_to(img.width(), img.height()).to_int();
    let (x1, y1) = (x1.max(0) as u32, y1.max(0) as u32);
    let (x2, y2) = (x2.max(0) as u32, y2.max(0) as u32);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(img.crop_imm(x1, y1, x2 - x1, y2 - y1))
}
