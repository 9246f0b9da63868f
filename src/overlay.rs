// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Annotations drawn onto the display copy of each frame: a circle around
// every face with an intensity gauge above it, a hold-progress bar under the
// face being held, and a best-intensity gauge in the top left corner.

use std::time::Duration;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_circle_mut,
                         draw_hollow_rect_mut};
use imageproc::rect::Rect;

use smile_elements::detector_trait::FaceBox;

use crate::capture_state::HoldStatus;

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const GAUGE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const HOLD_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const OUTLINE_COLOR: Rgb<u8> = Rgb([200, 200, 200]);

const GAUGE_HEIGHT: u32 = 8;
const BEST_GAUGE_WIDTH: u32 = 200;

#[derive(Clone, Copy, Debug)]
pub struct FaceAnnotation {
    pub face: FaceBox,
    pub intensity: f64,
}

/// Draws the frame's annotations onto `frame`. `held_face` is the face whose
/// intensity drives `hold`.
pub fn annotate(frame: &mut RgbImage,
                faces: &[FaceAnnotation],
                held_face: Option<&FaceBox>,
                hold: &HoldStatus,
                hold_duration: Duration,
                best_intensity: f64) {
    for annotation in faces {
        let face = &annotation.face;
        let (cx, cy) = face.center();
        let radius = face.radius();
        if radius > 0 {
            // Three pixels thick.
            for r in radius - 1..=radius + 1 {
                draw_hollow_circle_mut(frame, (cx, cy), r.max(1), FACE_COLOR);
            }
        }
        let gauge_width = face.width.max(1) as u32;
        draw_gauge(frame, face.x, cy - radius - 14, gauge_width,
                   annotation.intensity / 100.0, GAUGE_COLOR);
    }

    if let Some(face) = held_face {
        let (_, cy) = face.center();
        let progress = match hold {
            HoldStatus::Holding{elapsed, ..} if !hold_duration.is_zero() => {
                elapsed.as_secs_f64() / hold_duration.as_secs_f64()
            },
            HoldStatus::Confirmed | HoldStatus::Captured => 1.0,
            _ => 0.0,
        };
        if progress > 0.0 {
            draw_gauge(frame, face.x, cy + face.radius() + 6,
                       face.width.max(1) as u32, progress, HOLD_COLOR);
        }
    }

    draw_gauge(frame, 10, 10, BEST_GAUGE_WIDTH, best_intensity / 100.0, HOLD_COLOR);
}

// Outlined horizontal bar at (x, y), filled to `fraction` (clamped to 0..1).
fn draw_gauge(frame: &mut RgbImage, x: i32, y: i32, width: u32, fraction: f64,
              color: Rgb<u8>) {
    let outline = Rect::at(x, y).of_size(width, GAUGE_HEIGHT);
    draw_hollow_rect_mut(frame, outline, OUTLINE_COLOR);
    let filled = (width as f64 * fraction.clamp(0.0, 1.0)).round() as u32;
    if filled > 0 {
        draw_filled_rect_mut(frame, Rect::at(x, y).of_size(filled, GAUGE_HEIGHT), color);
    }
}

// mod tests.
