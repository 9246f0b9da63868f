// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

pub const FACE_MODEL_FILE: &str = "haarcascade_frontalface_default.xml";
pub const SMILE_MODEL_FILE: &str = "haarcascade_smile.xml";

/// Parameters of one capture session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    // The session ends without a capture once this much time has passed.
    pub timeout: Duration,

    // Created on demand.
    pub output_directory: PathBuf,

    // How long the smile intensity must stay at or above `capture_threshold`.
    pub hold_duration: Duration,

    // In (0, 100].
    pub capture_threshold: f64,

    // Frames are downscaled by this factor for face detection.
    pub face_scale: f64,

    // Per-face wall clock budget for smile scoring. A face whose scoring
    // takes longer scores 0 for that frame.
    pub score_budget: Duration,

    // Flip frames horizontally so the display behaves like a mirror. The
    // exported crop is taken from the flipped frame.
    pub mirror: bool,

    // After a successful capture, delete older captures from
    // `output_directory`.
    pub prune_old_captures: bool,

    pub file_prefix: String,
    pub file_extension: String,

    // Draw face circles and gauges on the frames passed to the display
    // callback.
    pub annotate: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig{
            timeout: Duration::from_secs(30),
            output_directory: PathBuf::from("smile_captures"),
            hold_duration: Duration::from_secs(3),
            capture_threshold: 98.0,
            face_scale: 0.6,
            score_budget: Duration::from_millis(200),
            mirror: true,
            prune_old_captures: false,
            file_prefix: "face".to_string(),
            file_extension: "png".to_string(),
            annotate: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.timeout.is_zero() {
            return Err(invalid_argument_error("Timeout must be positive"));
        }
        if !(self.capture_threshold > 0.0 && self.capture_threshold <= 100.0) {
            return Err(invalid_argument_error(
                &format!("Capture threshold must be in (0, 100]; got {}",
                         self.capture_threshold)));
        }
        if !(self.face_scale > 0.0 && self.face_scale <= 1.0) {
            return Err(invalid_argument_error(
                &format!("Face scale must be in (0, 1]; got {}", self.face_scale)));
        }
        if self.score_budget.is_zero() {
            return Err(invalid_argument_error("Score budget must be positive"));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(|c: char| c == '/' || c == '\\') {
            return Err(invalid_argument_error(
                &format!("Invalid file prefix {:?}", self.file_prefix)));
        }
        let extension = self.file_extension.trim_start_matches('.').to_ascii_lowercase();
        if !["png", "jpg", "jpeg", "bmp", "tiff"].contains(&extension.as_str()) {
            return Err(invalid_argument_error(
                &format!("Unsupported file extension {:?}", self.file_extension)));
        }
        Ok(())
    }
}

// mod tests.
