//! Region cropping and JPEG thumbnails.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use percept_models::BoundingBox;

use crate::error::{TrackingError, TrackingResult};

/// Longest side of an encoded thumbnail, in pixels.
pub const THUMBNAIL_MAX_SIDE: u32 = 160;

/// JPEG quality used for thumbnails.
pub const THUMBNAIL_QUALITY: u8 = 80;

/// Pixel rectangle covered by a normalized box, or `None` if it covers no
/// whole pixel.
pub fn pixel_rect(width: u32, height: u32, bbox: &BoundingBox) -> Option<(u32, u32, u32, u32)> {
    let clipped = bbox.clamp_to_frame()?;

    let x0 = (clipped.x * width as f64).floor() as u32;
    let y0 = (clipped.y * height as f64).floor() as u32;
    let x1 = ((clipped.x2() * width as f64).ceil() as u32).min(width);
    let y1 = ((clipped.y2() * height as f64).ceil() as u32).min(height);

    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

/// Copy the region of `image` under a normalized box.
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = pixel_rect(image.width(), image.height(), bbox)?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Crop, downscale and JPEG-encode the region under a normalized box.
pub fn encode_thumbnail(image: &RgbImage, bbox: &BoundingBox) -> TrackingResult<Vec<u8>> {
    let region = crop_region(image, bbox)
        .ok_or_else(|| TrackingError::internal("thumbnail region is empty"))?;

    let region = if region.width().max(region.height()) > THUMBNAIL_MAX_SIDE {
        let scale = THUMBNAIL_MAX_SIDE as f64 / region.width().max(region.height()) as f64;
        let w = ((region.width() as f64 * scale).round() as u32).max(1);
        let h = ((region.height() as f64 * scale).round() as u32).max(1);
        imageops::resize(&region, w, h, FilterType::Triangle)
    } else {
        region
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, THUMBNAIL_QUALITY).encode_image(&region)?;
    Ok(bytes)
}
