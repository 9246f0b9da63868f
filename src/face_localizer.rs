// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use canonical_error::{CanonicalError, invalid_argument_error};
use image::{GrayImage, RgbImage};
use image::imageops;

use smile_elements::detector_trait::{DetectParams, DetectorTrait, FaceBox};
use smile_elements::image_utils::{downscale, equalize};

// Favors precision on small/near faces.
const PRECISION_PASS: DetectParams =
    DetectParams{scale_factor: 1.05, min_neighbors: 3,
                 min_size: (25, 25), max_size: (200, 200)};

// Favors recall on larger faces.
const RECALL_PASS: DetectParams =
    DetectParams{scale_factor: 1.15, min_neighbors: 2,
                 min_size: (50, 50), max_size: (0, 0)};

/// Grayscale renditions of one frame, as consumed by FaceLocalizer and
/// SmileScorer.
pub struct GrayFrames {
    // Full resolution, not equalized. Face crops are taken from this.
    pub full: GrayImage,

    // Downscaled by the localizer's scale and histogram-equalized.
    pub small: GrayImage,
}

impl GrayFrames {
    pub fn new(frame: &RgbImage, scale: f64) -> Self {
        let full = imageops::grayscale(frame);
        let small = equalize(&downscale(&full, scale));
        GrayFrames{full, small}
    }
}

/// Finds candidate faces with two detector passes over a downscaled frame.
pub struct FaceLocalizer {
    detector: Arc<dyn DetectorTrait>,

    // Factor by which frames are downscaled before detection, in (0, 1].
    scale: f64,
}

impl FaceLocalizer {
    pub fn new(detector: Arc<dyn DetectorTrait>, scale: f64)
               -> Result<Self, CanonicalError> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(invalid_argument_error(
                &format!("Face scale must be in (0, 1]; got {}", scale)));
        }
        Ok(FaceLocalizer{detector, scale})
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn prepare(&self, frame: &RgbImage) -> GrayFrames {
        GrayFrames::new(frame, self.scale)
    }

    /// Runs both passes over `small` (see GrayFrames) and returns their
    /// concatenated results in full-frame coordinates. Overlapping results of
    /// the two passes are not merged.
    pub fn locate(&self, small: &GrayImage) -> Vec<FaceBox> {
        if small.width() == 0 || small.height() == 0 {
            return Vec::new();
        }
        let mut faces = self.detector.detect_multi_scale(small, &PRECISION_PASS);
        faces.extend(self.detector.detect_multi_scale(small, &RECALL_PASS));
        let inverse = 1.0 / self.scale;
        faces.iter().map(|f| f.scaled(inverse)).collect()
    }
}

// mod tests.
