// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{GenericImageView, GrayImage, Luma, RgbImage, Rgba, RgbaImage};
use image::imageops::{self, FilterType};
use imageproc::contrast::equalize_histogram;
use imageproc::drawing::draw_filled_circle_mut;

use crate::detector_trait::FaceBox;

// Returns a copy of `image` resized by `factor` (e.g. 0.6), with bilinear
// interpolation. Each dimension is rounded and kept at least 1 pixel.
pub fn downscale(image: &GrayImage, factor: f64) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let new_w = ((width as f64 * factor).round() as u32).max(1);
    let new_h = ((height as f64 * factor).round() as u32).max(1);
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}

// Histogram equalization; empty images are returned as-is.
pub fn equalize(image: &GrayImage) -> GrayImage {
    if image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    equalize_histogram(image)
}

// Copies the part of `face` lying within `image`. Returns None if the
// intersection is empty.
pub fn crop_gray(image: &GrayImage, face: &FaceBox) -> Option<GrayImage> {
    let (width, height) = image.dimensions();
    let clipped = face.clip_to(width, height)?;
    Some(image.view(clipped.x as u32, clipped.y as u32,
                    clipped.width as u32, clipped.height as u32).to_image())
}

// Mean pixel value, or None for an empty image.
pub fn mean_intensity(image: &GrayImage) -> Option<f64> {
    let raw = image.as_raw();
    if raw.is_empty() {
        return None;
    }
    let sum: u64 = raw.iter().map(|v| *v as u64).sum();
    Some(sum as f64 / raw.len() as f64)
}

// Extracts the disk of `radius` around (`center_x`, `center_y`). Pixels of the
// bounding square outside the disk are fully transparent black. The square is
// clipped to the image, so a disk near the edge yields a smaller crop. Returns
// None if nothing remains after clipping.
// `image` is not modified.
pub fn crop_circle(image: &RgbImage, center_x: i32, center_y: i32, radius: i32)
                   -> Option<RgbaImage> {
    if radius <= 0 {
        return None;
    }
    let (width, height) = image.dimensions();
    let x_min = (center_x - radius).max(0);
    let x_max = (center_x + radius).min(width as i32);
    let y_min = (center_y - radius).max(0);
    let y_max = (center_y + radius).min(height as i32);
    if x_max <= x_min || y_max <= y_min {
        return None;
    }
    let crop_w = (x_max - x_min) as u32;
    let crop_h = (y_max - y_min) as u32;

    let mut mask = GrayImage::new(crop_w, crop_h);
    draw_filled_circle_mut(&mut mask, (center_x - x_min, center_y - y_min),
                           radius, Luma([255_u8]));

    let mut result = RgbaImage::new(crop_w, crop_h);
    for (x, y, out) in result.enumerate_pixels_mut() {
        if mask.get_pixel(x, y).0[0] == 0 {
            *out = Rgba([0, 0, 0, 0]);
            continue;
        }
        let rgb = image.get_pixel(x + x_min as u32, y + y_min as u32).0;
        *out = Rgba([rgb[0], rgb[1], rgb[2], 255]);
    }
    Some(result)
}

// mod tests.
