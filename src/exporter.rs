// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use canonical_error::{CanonicalError, failed_precondition_error, internal_error};
use chrono::Local;
use image::{DynamicImage, RgbImage, RgbaImage};
use log::{info, warn};

use smile_elements::detector_trait::FaceBox;
use smile_elements::image_utils::crop_circle;

/// Writes the circular crop of a confirmed face to the output directory.
pub struct Exporter {
    output_dir: PathBuf,
    file_prefix: String,
    // Without leading dot, e.g. "png". Determines the encoding.
    file_extension: String,
}

impl Exporter {
    pub fn new(output_dir: &Path, file_prefix: &str, file_extension: &str) -> Self {
        Exporter{output_dir: output_dir.to_path_buf(),
                 file_prefix: file_prefix.to_string(),
                 file_extension: file_extension.trim_start_matches('.').to_string()}
    }

    /// Crops the disk enclosing `face` out of `frame` (RGB order) and saves it
    /// as `<prefix>_<YYYYMMDD_HHMMSS>.<ext>`, creating the output directory if
    /// needed. Returns the path written.
    pub fn export(&self, frame: &RgbImage, face: &FaceBox)
                  -> Result<PathBuf, CanonicalError> {
        let (center_x, center_y) = face.center();
        let Some(crop) = crop_circle(frame, center_x, center_y, face.radius()) else {
            return Err(failed_precondition_error(
                &format!("Face {:?} yields an empty crop of {}x{} frame",
                         face, frame.width(), frame.height())));
        };
        if let Err(e) = fs::create_dir_all(&self.output_dir) {
            return Err(internal_error(
                &format!("Could not create {:?}: {:?}", self.output_dir, e)));
        }
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.output_dir.join(
            format!("{}_{}.{}", self.file_prefix, timestamp, self.file_extension));
        self.save(crop, &path)?;
        info!("Saved capture {:?}", path);
        Ok(path)
    }

    fn save(&self, crop: RgbaImage, path: &Path) -> Result<(), CanonicalError> {
        let result = match self.file_extension.to_ascii_lowercase().as_str() {
            // No alpha channel; the area outside the disk stays black.
            "jpg" | "jpeg" => DynamicImage::ImageRgba8(crop).to_rgb8().save(path),
            _ => crop.save(path),
        };
        result.map_err(|e| internal_error(&format!("Could not write {:?}: {:?}", path, e)))
    }

    /// Returns the most recently modified capture in the output directory, if
    /// any. A missing directory has no captures.
    pub fn latest(&self) -> Option<PathBuf> {
        if !self.output_dir.is_dir() {
            return None;
        }
        match self.list_captures() {
            Ok(mut captures) => captures.pop().map(|(_, path)| path),
            Err(e) => {
                warn!("{:?}", e);
                None
            }
        }
    }

    /// Deletes every capture in the output directory except the most recent.
    /// Returns the number of files deleted.
    pub fn prune(&self) -> Result<usize, CanonicalError> {
        if !self.output_dir.is_dir() {
            return Ok(0);
        }
        let mut captures = self.list_captures()?;
        captures.pop();
        let mut deleted = 0;
        for (_, path) in captures {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Could not delete {:?}: {:?}", path, e),
            }
        }
        if deleted > 0 {
            info!("Deleted {} old capture(s) from {:?}", deleted, self.output_dir);
        }
        Ok(deleted)
    }

    // Names this exporter writes, `<prefix>_*.<ext>`, plus the older
    // `smile_capture_*.jpg` naming.
    fn is_capture_file(&self, name: &str) -> bool {
        let own = name.strip_prefix(&self.file_prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.rsplit_once('.'))
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(&self.file_extension));
        own || (name.starts_with("smile_capture_") && name.ends_with(".jpg"))
    }

    // Capture files with their modification times, oldest first.
    fn list_captures(&self) -> Result<Vec<(SystemTime, PathBuf)>, CanonicalError> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(e) => e,
            Err(e) => {
                return Err(internal_error(
                    &format!("Could not read {:?}: {:?}", self.output_dir, e)));
            }
        };
        let mut captures = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.is_capture_file(name) {
                continue;
            }
            match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => captures.push((modified, entry.path())),
                Err(e) => warn!("Skipping {:?}: {:?}", entry.path(), e),
            }
        }
        captures.sort();
        Ok(captures)
    }
}

// mod tests.
