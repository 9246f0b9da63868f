// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod capture_engine;
pub mod capture_state;
pub mod config;
pub mod exporter;
pub mod face_localizer;
pub mod haar_cascade;
pub mod identity_tracker;
pub mod image_camera;
pub mod latency_stats;
pub mod overlay;
pub mod smile_scorer;

#[cfg(feature = "webcam")]
pub mod webcam;
