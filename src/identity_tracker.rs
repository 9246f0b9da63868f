// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::debug;

use smile_elements::detector_trait::FaceBox;

// A candidate this close to a previous box (center distance and size delta,
// in pixels) is the same face.
const NEAR_DISTANCE: f64 = 40.0;
const NEAR_SIZE_DELTA: i32 = 20;

// The same face must have moved more than this (center distance or size
// delta) for its new position to be surfaced.
const STABILITY_DISTANCE: f64 = 8.0;
const STABILITY_SIZE_DELTA: i32 = 4;

/// De-jitter filter for face boxes. Holds only the boxes accepted in the
/// immediately preceding frame; identity is the index into that list and has
/// no meaning beyond one frame.
#[derive(Default)]
pub struct IdentityTracker {
    previous: Vec<FaceBox>,
}

// How a candidate relates to the previous box it is compared against.
#[derive(Debug, PartialEq)]
enum Match {
    // Same face, moved or resized enough to take the new position.
    Moved,

    // Same face, barely moved. The previous position is kept.
    Jitter,

    // Relocated or different face.
    Far,
}

impl IdentityTracker {
    pub fn new() -> Self {
        IdentityTracker{previous: Vec::new()}
    }

    /// Applies jitter suppression to this frame's `candidates` and returns the
    /// accepted boxes, which also become the reference for the next call.
    ///
    /// Each candidate is compared with the nearest not-yet-matched previous
    /// box, consuming it. A candidate that barely moved is replaced by the
    /// previous box. Candidates left without any previous box are new faces.
    /// Previous boxes that no candidate matched are forgotten.
    pub fn filter(&mut self, candidates: &[FaceBox]) -> Vec<FaceBox> {
        let mut matched = vec![false; self.previous.len()];
        let mut accepted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let nearest = self.previous.iter().enumerate()
                .filter(|(i, _)| !matched[*i])
                .map(|(i, prev)| (i, center_distance(candidate, prev)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            let Some((index, distance)) = nearest else {
                accepted.push(*candidate);
                continue;
            };
            matched[index] = true;
            let prev = &self.previous[index];
            match classify(distance, size_delta(candidate, prev)) {
                Match::Moved | Match::Far => accepted.push(*candidate),
                Match::Jitter => {
                    debug!("Suppressed jitter {:?} -> {:?}", prev, candidate);
                    accepted.push(*prev);
                },
            }
        }
        self.previous = accepted.clone();
        accepted
    }

    pub fn previous(&self) -> &[FaceBox] {
        &self.previous
    }
}

fn center_distance(a: &FaceBox, b: &FaceBox) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    let dx = (ax - bx) as f64;
    let dy = (ay - by) as f64;
    (dx * dx + dy * dy).sqrt()
}

fn size_delta(a: &FaceBox, b: &FaceBox) -> i32 {
    (a.width - b.width).abs() + (a.height - b.height).abs()
}

fn classify(distance: f64, size_delta: i32) -> Match {
    if distance >= NEAR_DISTANCE || size_delta >= NEAR_SIZE_DELTA {
        return Match::Far;
    }
    if distance > STABILITY_DISTANCE || size_delta > STABILITY_SIZE_DELTA {
        Match::Moved
    } else {
        Match::Jitter
    }
}

// mod tests.
