// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error, unavailable_error};
use image::RgbImage;
use log::info;

use smile_elements::frame_source_trait::{ChannelOrder, Frame, FrameSourceTrait};

/// Frame source that replays still images in a loop, standing in for a
/// webcam.
pub struct ImageCamera {
    images: Vec<RgbImage>,
    channel_order: ChannelOrder,

    // Minimum time between frames, emulating a camera's frame rate.
    frame_interval: Duration,

    // If set, capture_frame() fails after this many frames.
    frame_limit: Option<usize>,

    next_frame_id: i32,
    last_frame_time: Option<Instant>,
    released: bool,
}

impl ImageCamera {
    /// All `images` must have the same dimensions.
    pub fn new(images: Vec<RgbImage>) -> Result<Self, CanonicalError> {
        let Some(first) = images.first() else {
            return Err(invalid_argument_error("ImageCamera needs at least one image"));
        };
        let dimensions = first.dimensions();
        if dimensions.0 == 0 || dimensions.1 == 0 {
            return Err(invalid_argument_error("ImageCamera image is empty"));
        }
        if images.iter().any(|i| i.dimensions() != dimensions) {
            return Err(invalid_argument_error("ImageCamera images differ in size"));
        }
        Ok(ImageCamera{images,
                       channel_order: ChannelOrder::Rgb,
                       frame_interval: Duration::ZERO,
                       frame_limit: None,
                       next_frame_id: 0,
                       last_frame_time: None,
                       released: false})
    }

    pub fn from_file(path: &Path) -> Result<Self, CanonicalError> {
        if !path.exists() {
            return Err(not_found_error(&format!("Test image {:?} not found", path)));
        }
        let image = match image::open(path) {
            Ok(i) => i.to_rgb8(),
            Err(e) => {
                return Err(invalid_argument_error(
                    &format!("Could not decode {:?}: {:?}", path, e)));
            }
        };
        info!("Using test image {:?} ({}x{}) instead of camera",
              path, image.width(), image.height());
        Self::new(vec![image])
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    // Declares the stored images to be BGR, as some camera backends deliver.
    pub fn with_channel_order(mut self, channel_order: ChannelOrder) -> Self {
        self.channel_order = channel_order;
        self
    }
}

impl FrameSourceTrait for ImageCamera {
    fn model(&self) -> String {
        "ImageCamera".to_string()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.images[0].dimensions()
    }

    fn capture_frame(&mut self) -> Result<Frame, CanonicalError> {
        if self.released {
            return Err(failed_precondition_error("ImageCamera was released"));
        }
        let frames_produced = self.next_frame_id as usize;
        if let Some(limit) = self.frame_limit {
            if frames_produced >= limit {
                return Err(unavailable_error(
                    &format!("ImageCamera stopped after {} frames", limit)));
            }
        }
        if let Some(last) = self.last_frame_time {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame_time = Some(Instant::now());
        let image = self.images[frames_produced % self.images.len()].clone();
        let frame = Frame::new(image, self.channel_order, self.next_frame_id);
        self.next_frame_id += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

// mod tests.
