// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::GrayImage;

/// Axis-aligned rectangle in image coordinates. The upper-left pixel is at
/// 0, 0. A FaceBox can extend past the image bounds (e.g. after rescaling a
/// detection from a downscaled image); use clip_to() before indexing pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        FaceBox{x, y, width, height}
    }

    // Integer center, rounding toward the upper-left.
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.width as i64 * self.height as i64
    }

    // Radius of the circle enclosing the box, as drawn around a face.
    pub fn radius(&self) -> i32 {
        std::cmp::max(self.width, self.height) / 2
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Multiplies all four components by `factor`, truncating toward zero.
    /// Used to map detections on a downscaled image back to full resolution.
    pub fn scaled(&self, factor: f64) -> FaceBox {
        FaceBox{
            x: (self.x as f64 * factor) as i32,
            y: (self.y as f64 * factor) as i32,
            width: (self.width as f64 * factor) as i32,
            height: (self.height as f64 * factor) as i32,
        }
    }

    /// Returns the part of this box that lies within a `width` x `height`
    /// image, or None if there is no overlap.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<FaceBox> {
        let left = self.x.max(0);
        let top = self.y.max(0);
        let right = (self.x + self.width).min(width as i32);
        let bottom = (self.y + self.height).min(height as i32);
        if right <= left || bottom <= top {
            return None;
        }
        Some(FaceBox{x: left, y: top, width: right - left, height: bottom - top})
    }

    pub fn translated(&self, dx: i32, dy: i32) -> FaceBox {
        FaceBox{x: self.x + dx, y: self.y + dy, ..*self}
    }
}

/// Parameters for one multi-scale detection pass. Sizes are (width, height)
/// in pixels of the image handed to the detector; a zero `max_size` means
/// "no upper bound".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectParams {
    // Ratio between successive window sizes. Must be > 1.
    pub scale_factor: f64,

    // A detection is reported only if at least this many overlapping raw
    // windows (plus one) agree.
    pub min_neighbors: u32,

    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

impl DetectParams {
    pub fn new(scale_factor: f64, min_neighbors: u32,
               min_size: (u32, u32), max_size: (u32, u32)) -> Self {
        DetectParams{scale_factor, min_neighbors, min_size, max_size}
    }
}

impl Default for DetectParams {
    fn default() -> Self {
        DetectParams{
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: (0, 0),
            max_size: (0, 0),
        }
    }
}

/// A classical sliding-window object detector, e.g. a boosted Haar cascade.
/// Implementations must be usable from the per-face scoring worker threads.
pub trait DetectorTrait: Send + Sync {
    /// Returns the detected objects' bounding boxes in `image` coordinates.
    /// An empty or too-small image yields an empty result, never an error.
    fn detect_multi_scale(&self, image: &GrayImage, params: &DetectParams)
                          -> Vec<FaceBox>;

    /// Size of the detector's base window, (width, height).
    fn window_size(&self) -> (u32, u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_and_radius() {
        let b = FaceBox::new(10, 20, 31, 40);
        assert_eq!(b.center(), (25, 40));
        assert_eq!(b.radius(), 20);
        assert_eq!(b.area(), 1240);
    }

    #[test]
    fn test_scaled_truncates() {
        let b = FaceBox::new(30, 31, 60, 61);
        assert_eq!(b.scaled(1.0 / 0.6), FaceBox::new(50, 51, 100, 101));
    }

    #[test]
    fn test_clip_to() {
        let b = FaceBox::new(-10, -5, 30, 30);
        assert_eq!(b.clip_to(100, 100), Some(FaceBox::new(0, 0, 20, 25)));

        let b = FaceBox::new(90, 90, 30, 30);
        assert_eq!(b.clip_to(100, 100), Some(FaceBox::new(90, 90, 10, 10)));

        // Entirely outside.
        let b = FaceBox::new(200, 10, 30, 30);
        assert_eq!(b.clip_to(100, 100), None);

        // Degenerate.
        assert_eq!(FaceBox::new(5, 5, 0, 10).clip_to(100, 100), None);
        assert_eq!(FaceBox::new(5, 5, 0, 10).area(), 0);
    }

}  // mod tests.
