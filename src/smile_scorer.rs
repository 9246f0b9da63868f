// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::edges::canny;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::filter::Kernel;
use imageproc::point::Point;
use log::{debug, warn};

use smile_elements::detector_trait::{DetectParams, DetectorTrait, FaceBox};
use smile_elements::image_utils::mean_intensity;

// The mouth band starts this far down the face crop.
pub const MOUTH_BAND_START: f64 = 0.55;

// Upper bound of curve_score().
pub const MAX_CURVE_SCORE: f64 = 60.0;

// Smile cascade passes, most strict first. The first pass with any
// detections is used.
const SMILE_PASSES: [DetectParams; 3] = [
    DetectParams{scale_factor: 1.3, min_neighbors: 10,
                 min_size: (15, 15), max_size: (0, 0)},
    DetectParams{scale_factor: 1.5, min_neighbors: 8,
                 min_size: (20, 20), max_size: (0, 0)},
    DetectParams{scale_factor: 1.8, min_neighbors: 12,
                 min_size: (25, 25), max_size: (0, 0)},
];

// Above this curve score, cascade detections are reinforced.
const BOOST_CURVE_SCORE: f64 = 50.0;

// Above this curve score, the curve analysis alone asserts a smile.
const SYNTHETIC_CURVE_SCORE: f64 = 40.0;

// 5x5 Sobel y-derivative: [-1 -2 0 2 1] down, [1 4 6 4 1] across.
const SOBEL_Y_5X5: [i32; 25] = [
    -1, -4,  -6, -4, -1,
    -2, -8, -12, -8, -2,
     0,  0,   0,  0,  0,
     2,  8,  12,  8,  2,
     1,  4,   6,  4,  1,
];

// Minimum |dy| of the 5x5 Sobel for a pixel to be on a horizontal line.
const HORIZONTAL_LINE_GRADIENT: i32 = 30;

// Result of scoring one face in one frame.
#[derive(Clone, Debug, Default)]
pub struct SmileAnalysis {
    // Smile regions, relative to the face crop, after fusing the cascade and
    // curve signals.
    pub detections: Vec<FaceBox>,

    // Number of detections the smile cascade produced on its own.
    pub cascade_count: usize,

    // 0..=MAX_CURVE_SCORE.
    pub curve_score: f64,

    // 0..=100.
    pub intensity: f64,
}

/// Computes a 0..100 smile intensity for one face from the current frame
/// only; no state is carried between calls.
pub struct SmileScorer {
    detector: Arc<dyn DetectorTrait>,
}

impl SmileScorer {
    pub fn new(detector: Arc<dyn DetectorTrait>) -> Self {
        SmileScorer{detector}
    }

    /// `face_gray` is the histogram-equalized grayscale crop of one face.
    pub fn analyze(&self, face_gray: &GrayImage) -> SmileAnalysis {
        let (width, height) = face_gray.dimensions();
        if width == 0 || height == 0 {
            return SmileAnalysis::default();
        }
        let cascade = self.cascade_signal(face_gray);
        let cascade_count = cascade.len();
        let curve = curve_score(face_gray);
        let detections = fuse_detections(cascade, curve, width, height);
        let intensity = smile_intensity(&detections);
        SmileAnalysis{detections, cascade_count, curve_score: curve, intensity}
    }

    // Runs the smile cascade passes in order of strictness, returning the
    // first non-empty result.
    pub fn cascade_signal(&self, face_gray: &GrayImage) -> Vec<FaceBox> {
        for params in &SMILE_PASSES {
            let smiles = self.detector.detect_multi_scale(face_gray, params);
            if !smiles.is_empty() {
                return smiles;
            }
        }
        Vec::new()
    }
}

/// Runs `scorer.analyze(face_gray)` on a fresh worker thread and waits at most
/// `budget` for it. Returns None if the budget expires (or the worker could
/// not be started); the worker is then left to finish on its own and its
/// result is dropped.
pub fn score_with_budget(scorer: &Arc<SmileScorer>, face_gray: GrayImage,
                         budget: Duration) -> Option<SmileAnalysis> {
    let (sender, receiver) = mpsc::channel();
    let cloned_scorer = scorer.clone();
    let spawned = thread::Builder::new()
        .name("smile-scorer".to_string())
        .spawn(move || {
            let analysis = cloned_scorer.analyze(&face_gray);
            // The frame loop may have stopped waiting.
            let _ = sender.send(analysis);
        });
    if let Err(e) = spawned {
        warn!("Could not start smile scorer thread: {}", e);
        return None;
    }
    match receiver.recv_timeout(budget) {
        Ok(analysis) => Some(analysis),
        Err(_) => {
            debug!("Smile scoring exceeded {:?}", budget);
            None
        }
    }
}

// Row at which the mouth band starts, for a face crop of `height` rows.
pub fn mouth_band_start(height: u32) -> u32 {
    (height as f64 * MOUTH_BAND_START) as u32
}

/// Geometric smile evidence from the mouth band of `face_gray`: edge density,
/// contour complexity, mouth vs. upper face shading, and horizontal line
/// density. Returns 0..=60; an empty crop or band scores 0.
pub fn curve_score(face_gray: &GrayImage) -> f64 {
    let (width, height) = face_gray.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let band_start = mouth_band_start(height);
    let mouth = image::imageops::crop_imm(
        face_gray, 0, band_start, width, height - band_start).to_image();
    let upper = image::imageops::crop_imm(
        face_gray, 0, 0, width, band_start).to_image();
    if mouth.width() == 0 || mouth.height() == 0 {
        return 0.0;
    }

    let mut score = 0.0;
    // Canny and Sobel need a 3x3 neighborhood.
    if mouth.width() >= 3 && mouth.height() >= 3 {
        let edges = canny(&mouth, 50.0, 150.0);
        score += edge_density_score(&edges);
        score += contour_score(&edges);
        score += horizontal_line_score(&mouth);
    }
    score += brightness_score(&mouth, &upper);
    score.min(MAX_CURVE_SCORE)
}

// Up to 40 points, proportional to the fraction of edge pixels.
fn edge_density_score(edges: &GrayImage) -> f64 {
    let total = edges.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let edge_pixels = edges.as_raw().iter().filter(|v| **v > 0).count();
    edge_pixels as f64 / total as f64 * 40.0
}

// Each outer contour enclosing more than 20 square pixels contributes twice
// its simplified vertex count, up to 30.
fn contour_score(edges: &GrayImage) -> f64 {
    let mut score = 0.0;
    for contour in find_contours::<i32>(edges) {
        if contour.border_type != BorderType::Outer || contour.parent.is_some() {
            continue;
        }
        if polygon_area(&contour.points) <= 20.0 {
            continue;
        }
        let epsilon = 0.02 * arc_length(&contour.points, true);
        let approx = approximate_polygon_dp(&contour.points, epsilon, true);
        score += (approx.len() as f64 * 2.0).min(30.0);
    }
    score
}

// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0_i64;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    (twice_area as f64 / 2.0).abs()
}

// Up to 20 points for a shading difference between the mouth band and the
// rest of the face.
fn brightness_score(mouth: &GrayImage, upper: &GrayImage) -> f64 {
    match (mean_intensity(mouth), mean_intensity(upper)) {
        (Some(mouth_mean), Some(upper_mean)) => {
            ((mouth_mean - upper_mean).abs() / 5.0).min(20.0)
        },
        _ => 0.0,
    }
}

// Up to 25 points for strong vertical gradients, i.e. horizontal lines such
// as lip lines and smile creases.
fn horizontal_line_score(mouth: &GrayImage) -> f64 {
    let kernel = Kernel::new(&SOBEL_Y_5X5, 5, 5);
    let gradients: image::ImageBuffer<Luma<i32>, Vec<i32>> =
        kernel.filter(mouth, |out: &mut i32, acc: i32| *out = acc);
    let total = gradients.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let strong = gradients.as_raw().iter()
        .filter(|g| g.abs() > HORIZONTAL_LINE_GRADIENT).count();
    (strong as f64 / total as f64 * 100.0).min(25.0)
}

/// Combines the smile cascade's detections with the curve score for a face
/// crop of `width` x `height`:
/// * cascade hits with strong curve evidence: the first half of the hits are
///   counted twice;
/// * no cascade hits but convincing curve evidence: one synthetic detection
///   covering the middle of the mouth band;
/// * otherwise only the cascade's hits (possibly none).
pub fn fuse_detections(mut cascade: Vec<FaceBox>, curve_score: f64,
                       width: u32, height: u32) -> Vec<FaceBox> {
    if !cascade.is_empty() {
        if curve_score > BOOST_CURVE_SCORE && cascade.len() > 1 {
            let half = cascade.len() / 2;
            cascade.extend_from_within(..half);
        }
        return cascade;
    }
    if curve_score > SYNTHETIC_CURVE_SCORE {
        let (w, h) = (width as i32, height as i32);
        return vec![FaceBox::new(w / 4, mouth_band_start(height) as i32, w / 2, h / 3)];
    }
    Vec::new()
}

/// 40 points per detection plus 3 points per 50 square pixels of detected
/// area, clamped to 40..=100 when anything was detected and 0 otherwise.
pub fn smile_intensity(detections: &[FaceBox]) -> f64 {
    if detections.is_empty() {
        return 0.0;
    }
    let mut intensity = detections.len() as f64 * 40.0;
    for d in detections {
        intensity += d.area() as f64 / 50.0 * 3.0;
    }
    intensity.clamp(40.0, 100.0)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use approx::assert_abs_diff_eq;
    use super::*;

    // Returns the same boxes for every pass that permits them, optionally
    // after a delay.
    struct FakeSmileDetector {
        // Only passes with at most this many min_neighbors find anything.
        max_neighbors: u32,
        smiles: Vec<FaceBox>,
        delay: Duration,
    }

    impl DetectorTrait for FakeSmileDetector {
        fn detect_multi_scale(&self, _image: &GrayImage, params: &DetectParams)
                              -> Vec<FaceBox> {
            thread::sleep(self.delay);
            if params.min_neighbors <= self.max_neighbors {
                self.smiles.clone()
            } else {
                Vec::new()
            }
        }
        fn window_size(&self) -> (u32, u32) { (20, 10) }
    }

    fn fake_scorer(max_neighbors: u32, smiles: Vec<FaceBox>, delay: Duration)
                   -> Arc<SmileScorer> {
        Arc::new(SmileScorer::new(Arc::new(FakeSmileDetector{
            max_neighbors, smiles, delay})))
    }

    // A face-like crop: flat upper face, mouth band with a dark lip line.
    fn smiling_face(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let band = mouth_band_start(size);
            if y > band + 8 && y < band + 14 && x > size / 5 && x < size * 4 / 5 {
                Luma([10])
            } else if y >= band {
                Luma([200])
            } else {
                Luma([60])
            }
        })
    }

    #[test]
    fn test_smile_intensity() {
        assert_eq!(smile_intensity(&[]), 0.0);
        // One small box: 40 + 100 / 50 * 3.
        assert_abs_diff_eq!(smile_intensity(&[FaceBox::new(0, 0, 10, 10)]), 46.0);
        // Any detection reads as at least 40.
        assert_abs_diff_eq!(smile_intensity(&[FaceBox::new(0, 0, 0, 0)]), 40.0);
        // Clamped at 100.
        assert_abs_diff_eq!(smile_intensity(&[FaceBox::new(0, 0, 50, 33)]), 100.0);
        let many = vec![FaceBox::new(0, 0, 1, 1); 5];
        assert_abs_diff_eq!(smile_intensity(&many), 100.0);
    }

    #[test]
    fn test_smile_intensity_bounds() {
        for n in 1..6 {
            for side in [0, 1, 5, 20, 80] {
                let detections = vec![FaceBox::new(3, 4, side, side); n];
                let intensity = smile_intensity(&detections);
                assert!((40.0..=100.0).contains(&intensity),
                        "n={} side={} intensity={}", n, side, intensity);
            }
        }
    }

    #[test]
    fn test_fuse_synthetic_detection() {
        // Curve evidence alone above 40 yields one box within the mouth band.
        let fused = fuse_detections(Vec::new(), 45.0, 100, 100);
        assert_eq!(fused, vec![FaceBox::new(25, 55, 50, 33)]);
        let band = FaceBox::new(0, 55, 100, 45);
        let synthetic = fused[0];
        assert!(synthetic.y >= band.y);
        assert!(synthetic.x >= band.x && synthetic.x + synthetic.width <= band.width);
        assert!(synthetic.y + synthetic.height <= band.y + band.height);

        assert!(fuse_detections(Vec::new(), 30.0, 100, 100).is_empty());
        assert!(fuse_detections(Vec::new(), 40.0, 100, 100).is_empty());
    }

    #[test]
    fn test_fuse_boost() {
        let hits = vec![FaceBox::new(1, 1, 5, 5), FaceBox::new(2, 2, 5, 5),
                        FaceBox::new(3, 3, 5, 5)];
        // Strong curve evidence: first half (one hit) counted again.
        let fused = fuse_detections(hits.clone(), 55.0, 100, 100);
        assert_eq!(fused.len(), 4);
        assert_eq!(fused[3], hits[0]);

        // Weak curve evidence: unchanged.
        assert_eq!(fuse_detections(hits.clone(), 45.0, 100, 100), hits);

        // A single hit is never duplicated.
        let single = vec![FaceBox::new(1, 1, 5, 5)];
        assert_eq!(fuse_detections(single.clone(), 60.0, 100, 100), single);
    }

    #[test]
    fn test_curve_score_degenerate() {
        assert_eq!(curve_score(&GrayImage::new(0, 0)), 0.0);
        assert_eq!(curve_score(&GrayImage::new(10, 0)), 0.0);
        // Single row: upper band is empty, mouth band too small for edges.
        assert_eq!(curve_score(&GrayImage::from_pixel(10, 1, Luma([90]))), 0.0);
        // Featureless face.
        assert_eq!(curve_score(&GrayImage::from_pixel(60, 60, Luma([90]))), 0.0);
    }

    #[test]
    fn test_curve_score_features() {
        let face = smiling_face(100);
        let score = curve_score(&face);
        // The shading difference alone is capped at 20; the lip line adds
        // gradient evidence on top.
        assert!(score > 20.0, "score {}", score);
        assert!(score <= MAX_CURVE_SCORE);

        // Shading difference without any lines.
        let shaded = GrayImage::from_fn(100, 100, |_x, y| {
            if y >= 55 { Luma([150]) } else { Luma([100]) }
        });
        assert_abs_diff_eq!(curve_score(&shaded), 10.0);
    }

    #[test]
    fn test_horizontal_line_gentle_step() {
        // A 6-level lip line, too faint for a 3x3 Sobel at this threshold.
        let mouth = GrayImage::from_fn(100, 45, |_x, y| {
            if y < 20 { Luma([150]) } else { Luma([144]) }
        });
        // Rows 18..=21 respond with |dy| of 96 or 288.
        assert_abs_diff_eq!(horizontal_line_score(&mouth), 400.0 / 4500.0 * 100.0,
                            epsilon = 1e-9);

        assert_eq!(horizontal_line_score(&GrayImage::from_pixel(100, 45, Luma([150]))),
                   0.0);
        // Many lines saturate at 25.
        let stripes = GrayImage::from_fn(40, 40, |_x, y| {
            if (y / 3) % 2 == 0 { Luma([200]) } else { Luma([20]) }
        });
        assert_abs_diff_eq!(horizontal_line_score(&stripes), 25.0);
    }

    #[test]
    fn test_polygon_area() {
        let square = [Point::new(0, 0), Point::new(10, 0),
                      Point::new(10, 10), Point::new(0, 10)];
        assert_abs_diff_eq!(polygon_area(&square), 100.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn test_analyze_zero_area() {
        let scorer = fake_scorer(100, vec![FaceBox::new(0, 0, 10, 10)],
                                 Duration::ZERO);
        let analysis = scorer.analyze(&GrayImage::new(0, 0));
        assert_eq!(analysis.intensity, 0.0);
        assert!(analysis.detections.is_empty());
    }

    #[test]
    fn test_cascade_pass_order() {
        // Only the lenient second pass (8 neighbors) finds the smile.
        let smiles = vec![FaceBox::new(10, 60, 30, 15)];
        let scorer = fake_scorer(8, smiles.clone(), Duration::ZERO);
        let face = GrayImage::from_pixel(80, 80, Luma([100]));
        assert_eq!(scorer.cascade_signal(&face), smiles);

        let scorer = fake_scorer(5, smiles, Duration::ZERO);
        assert!(scorer.cascade_signal(&face).is_empty());
    }

    #[test]
    fn test_analyze_with_cascade_hit() {
        let scorer = fake_scorer(100, vec![FaceBox::new(10, 60, 30, 15)],
                                 Duration::ZERO);
        let face = GrayImage::from_pixel(80, 80, Luma([100]));
        let analysis = scorer.analyze(&face);
        assert_eq!(analysis.cascade_count, 1);
        // 40 + 450 / 50 * 3 = 67.
        assert_abs_diff_eq!(analysis.intensity, 67.0);
    }

    #[test]
    fn test_score_with_budget() {
        let scorer = fake_scorer(100, vec![FaceBox::new(10, 60, 30, 15)],
                                 Duration::ZERO);
        let face = GrayImage::from_pixel(80, 80, Luma([100]));
        let analysis = score_with_budget(&scorer, face.clone(),
                                         Duration::from_millis(2000)).unwrap();
        assert_abs_diff_eq!(analysis.intensity, 67.0);

        // A scorer that takes too long is abandoned promptly.
        let slow = fake_scorer(100, vec![FaceBox::new(10, 60, 30, 15)],
                               Duration::from_millis(500));
        let start = Instant::now();
        assert!(score_with_budget(&slow, face, Duration::from_millis(50)).is_none());
        assert!(start.elapsed() < Duration::from_millis(400));
    }

}  // mod tests.
