// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod detector_trait;
pub mod frame_source_trait;
pub mod image_utils;
