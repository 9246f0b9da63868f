// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use canonical_error::CanonicalError;
use image::RgbImage;

/// Byte order of the three color channels in a Frame's raster. Camera
/// backends differ; everything downstream of the frame source works in RGB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

pub struct Frame {
    // Three bytes per pixel, ordered per `channel_order`. Note that the
    // RgbImage type is used for storage even when the bytes are BGR.
    pub image: RgbImage,

    pub channel_order: ChannelOrder,

    // Increments with each frame produced by a FrameSourceTrait.
    pub frame_id: i32,

    // When the frame was read from the device. Hold and timeout arithmetic
    // is done against this.
    pub readout_time: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, channel_order: ChannelOrder, frame_id: i32) -> Self {
        Frame{image, channel_order, frame_id, readout_time: Instant::now()}
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Consumes the frame, returning its raster in RGB order.
    pub fn into_rgb(self) -> RgbImage {
        let mut image = self.image;
        if self.channel_order == ChannelOrder::Bgr {
            for pixel in image.pixels_mut() {
                pixel.0.swap(0, 2);
            }
        }
        image
    }
}

/// A camera (or camera stand-in) owned exclusively by one capture session.
pub trait FrameSourceTrait {
    /// Returns a string identifying the device.
    fn model(&self) -> String;

    /// (width, height) of the frames produced.
    fn dimensions(&self) -> (u32, u32);

    /// Blocks for at most one device read and returns the next frame.
    /// Errors are fatal to the capture session.
    fn capture_frame(&mut self) -> Result<Frame, CanonicalError>;

    /// Closes the device. Idempotent; capture_frame() fails afterwards.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

// mod tests.
