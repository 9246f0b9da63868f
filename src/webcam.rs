// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, failed_precondition_error,
                      internal_error, unavailable_error};
use image::RgbImage;
use log::{info, warn};
use nokhwa::Camera;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat,
                    RequestedFormatType, Resolution};

use smile_elements::frame_source_trait::{ChannelOrder, Frame, FrameSourceTrait};

pub const WEBCAM_WIDTH: u32 = 640;
pub const WEBCAM_HEIGHT: u32 = 480;
const WEBCAM_FPS: u32 = 30;

/// A USB/built-in webcam, opened at 640x480 (or the closest mode the device
/// offers).
pub struct Webcam {
    camera: Camera,
    model: String,
    dimensions: (u32, u32),
    next_frame_id: i32,
    streaming: bool,
}

impl Webcam {
    /// Opens camera `index` and starts streaming. One frame is read and
    /// discarded so that the first frame returned by capture_frame() is
    /// current rather than buffered from before the session.
    pub fn open(index: u32) -> Result<Self, CanonicalError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(Resolution::new(WEBCAM_WIDTH, WEBCAM_HEIGHT),
                              FrameFormat::YUYV, WEBCAM_FPS)));
        let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
            Ok(c) => c,
            Err(e) => {
                return Err(unavailable_error(
                    &format!("Could not open camera {}: {}", index, e)));
            }
        };
        if let Err(e) = camera.open_stream() {
            return Err(unavailable_error(
                &format!("Could not start camera {} stream: {}", index, e)));
        }
        let resolution = camera.resolution();
        let model = camera.info().human_name().to_string();
        info!("Opened camera {} ({}) at {}x{}", index, model,
              resolution.width(), resolution.height());
        let mut webcam = Webcam{camera,
                                model,
                                dimensions: (resolution.width(), resolution.height()),
                                next_frame_id: 0,
                                streaming: true};
        // Drain the stale frame.
        if let Err(e) = webcam.read_image() {
            webcam.release();
            return Err(e);
        }
        Ok(webcam)
    }

    fn read_image(&mut self) -> Result<RgbImage, CanonicalError> {
        let buffer = match self.camera.frame() {
            Ok(b) => b,
            Err(e) => {
                return Err(unavailable_error(&format!("Camera read failed: {}", e)));
            }
        };
        let decoded = match buffer.decode_image::<RgbFormat>() {
            Ok(d) => d,
            Err(e) => {
                return Err(unavailable_error(&format!("Frame decode failed: {}", e)));
            }
        };
        let (width, height) = (decoded.width(), decoded.height());
        match RgbImage::from_raw(width, height, decoded.into_raw()) {
            Some(image) => Ok(image),
            None => Err(internal_error(
                &format!("Frame buffer does not match {}x{}", width, height))),
        }
    }
}

impl FrameSourceTrait for Webcam {
    fn model(&self) -> String {
        self.model.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn capture_frame(&mut self) -> Result<Frame, CanonicalError> {
        if !self.streaming {
            return Err(failed_precondition_error("Camera was released"));
        }
        let image = self.read_image()?;
        let frame = Frame::new(image, ChannelOrder::Rgb, self.next_frame_id);
        self.next_frame_id += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.streaming {
            return;
        }
        self.streaming = false;
        if let Err(e) = self.camera.stop_stream() {
            warn!("Error stopping camera stream: {}", e);
        }
        info!("Released camera {}", self.model);
    }

    fn is_released(&self) -> bool {
        !self.streaming
    }
}

impl Drop for Webcam {
    fn drop(&mut self) {
        self.release();
    }
}
