// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use canonical_error::CanonicalError;
use image::RgbImage;
use image::imageops;
use log::{debug, error, info, warn};

use smile_elements::detector_trait::{DetectorTrait, FaceBox};
use smile_elements::frame_source_trait::{Frame, FrameSourceTrait};
use smile_elements::image_utils::{crop_gray, equalize};

use crate::capture_state::{CaptureStateMachine, HoldStatus};
use crate::config::SessionConfig;
use crate::exporter::Exporter;
use crate::face_localizer::FaceLocalizer;
use crate::identity_tracker::IdentityTracker;
use crate::latency_stats::LatencyStats;
use crate::overlay::{FaceAnnotation, annotate};
use crate::smile_scorer::{SmileAnalysis, SmileScorer, score_with_budget};

/// How a capture session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    // A smile was held long enough and its crop was written here.
    Captured(PathBuf),

    // The cancel flag was set, or the display callback asked to stop.
    Cancelled,

    // The session timeout elapsed. `faces_seen` tells whether any face was
    // ever found.
    TimedOut{faces_seen: bool},

    // The frame source failed; the session cannot continue.
    CameraFailed(CanonicalError),
}

impl SessionOutcome {
    pub fn captured_path(&self) -> Option<&Path> {
        match self {
            SessionOutcome::Captured(path) => Some(path),
            _ => None,
        }
    }
}

/// Per-session mutable state, owned by the CaptureEngine.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    // Highest frame intensity observed this session.
    pub best_intensity_seen: f64,

    // Start of the current hold streak, mirrored from the state machine.
    pub hold_start_time: Option<Instant>,

    // Set exactly once, on successful export.
    pub captured_output_path: Option<PathBuf>,

    pub faces_seen: bool,
    pub frames_processed: u64,
}

#[derive(Clone, Debug)]
pub struct FaceResult {
    pub face: FaceBox,

    // 0 if the face's crop was empty or scoring ran over budget.
    pub intensity: f64,

    // None if the face's crop was empty or scoring ran over budget.
    pub analysis: Option<SmileAnalysis>,
}

pub struct FrameResult {
    pub frame_id: i32,

    // After jitter suppression, in detector order.
    pub faces: Vec<FaceResult>,

    // Highest intensity among `faces`, or 0 if there are none.
    pub max_intensity: f64,

    pub hold: HoldStatus,

    // Set on the frame whose export succeeded.
    pub captured: Option<PathBuf>,

    // The frame in RGB order (mirrored if so configured), with annotations
    // if so configured. Intended for display.
    pub display: RgbImage,
}

/// Runs one capture session: reads frames, finds and scores faces, tracks
/// how long a smile has been held, and exports the face once the hold is
/// complete.
pub struct CaptureEngine {
    config: SessionConfig,
    frame_source: Box<dyn FrameSourceTrait>,
    localizer: FaceLocalizer,
    tracker: IdentityTracker,
    scorer: Arc<SmileScorer>,
    state_machine: CaptureStateMachine,
    exporter: Exporter,
    session: SessionState,

    // Wall time of process_frame().
    frame_latency: LatencyStats,

    // Wall time per face scored, including budget overruns.
    score_latency: LatencyStats,
    scores_over_budget: u64,
}

impl CaptureEngine {
    pub fn new(config: SessionConfig,
               frame_source: Box<dyn FrameSourceTrait>,
               face_detector: Arc<dyn DetectorTrait>,
               smile_detector: Arc<dyn DetectorTrait>)
               -> Result<Self, CanonicalError> {
        config.validate()?;
        let localizer = FaceLocalizer::new(face_detector, config.face_scale)?;
        let (width, height) = frame_source.dimensions();
        info!("Capture session using {} at {}x{}, timeout {:?}, hold {:?} at {}",
              frame_source.model(), width, height, config.timeout,
              config.hold_duration, config.capture_threshold);
        Ok(CaptureEngine{
            state_machine: CaptureStateMachine::new(config.capture_threshold,
                                                    config.hold_duration),
            exporter: Exporter::new(&config.output_directory, &config.file_prefix,
                                    &config.file_extension),
            config,
            frame_source,
            localizer,
            tracker: IdentityTracker::new(),
            scorer: Arc::new(SmileScorer::new(smile_detector)),
            session: SessionState::default(),
            frame_latency: LatencyStats::new(100),
            score_latency: LatencyStats::new(100),
            scores_over_budget: 0,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session
    }

    pub fn frame_source(&self) -> &dyn FrameSourceTrait {
        self.frame_source.as_ref()
    }

    pub fn frame_latency(&self) -> &LatencyStats {
        &self.frame_latency
    }

    pub fn score_latency(&self) -> &LatencyStats {
        &self.score_latency
    }

    /// Runs the session without display. See run_with_display().
    pub fn run(&mut self, cancel: &AtomicBool) -> SessionOutcome {
        self.run_with_display(cancel, |_| true)
    }

    /// Reads and processes frames until a capture succeeds, `cancel` is set,
    /// the session times out, or the frame source fails. Each processed
    /// frame's display image is passed to `display`, which returns false to
    /// cancel the session. The frame source is released before returning.
    pub fn run_with_display<F>(&mut self, cancel: &AtomicBool, mut display: F)
                               -> SessionOutcome
    where F: FnMut(&RgbImage) -> bool
    {
        if let Some(path) = &self.session.captured_output_path {
            return SessionOutcome::Captured(path.clone());
        }
        let start = Instant::now();
        let outcome = loop {
            if cancel.load(Ordering::SeqCst) {
                info!("Capture cancelled");
                break SessionOutcome::Cancelled;
            }
            if start.elapsed() >= self.config.timeout {
                info!("Capture timed out after {:?}{}", self.config.timeout,
                      if self.session.faces_seen { "" } else { "; no face was seen" });
                break SessionOutcome::TimedOut{faces_seen: self.session.faces_seen};
            }
            let frame = match self.frame_source.capture_frame() {
                Ok(f) => f,
                Err(e) => {
                    error!("Camera failure: {:?}", e);
                    break SessionOutcome::CameraFailed(e);
                }
            };
            let readout_time = frame.readout_time;
            let result = self.process_frame(frame, readout_time);
            let keep_going = display(&result.display);
            if let Some(path) = result.captured {
                break SessionOutcome::Captured(path);
            }
            if !keep_going {
                info!("Capture cancelled from display");
                break SessionOutcome::Cancelled;
            }
        };
        self.frame_source.release();
        self.log_stats();
        outcome
    }

    /// Processes one frame captured at `now`. Exposed for callers that drive
    /// their own frame loop (and for tests, which supply synthetic times).
    pub fn process_frame(&mut self, frame: Frame, now: Instant) -> FrameResult {
        let process_start = Instant::now();
        let frame_id = frame.frame_id;
        let mut image = frame.into_rgb();
        if self.config.mirror {
            imageops::flip_horizontal_in_place(&mut image);
        }

        let gray = self.localizer.prepare(&image);
        let candidates = self.localizer.locate(&gray.small);
        let faces = self.tracker.filter(&candidates);
        if !faces.is_empty() {
            self.session.faces_seen = true;
        }

        let mut face_results = Vec::with_capacity(faces.len());
        for face in faces {
            let analysis = self.score_face(&gray.full, &face);
            let intensity = analysis.as_ref().map_or(0.0, |a| a.intensity);
            face_results.push(FaceResult{face, intensity, analysis});
        }
        let best = face_results.iter()
            .fold(None, |best: Option<&FaceResult>, r| match best {
                Some(b) if b.intensity >= r.intensity => Some(b),
                _ => Some(r),
            });
        let max_intensity = best.map_or(0.0, |b| b.intensity);
        let best_face = best.map(|b| b.face);
        if max_intensity > self.session.best_intensity_seen {
            self.session.best_intensity_seen = max_intensity;
        }

        let mut hold = self.state_machine.update(max_intensity, now);
        let mut captured = None;
        if hold == HoldStatus::Confirmed {
            if let Some(face) = &best_face {
                match self.exporter.export(&image, face) {
                    Ok(path) => {
                        self.state_machine.export_succeeded();
                        self.session.captured_output_path = Some(path.clone());
                        self.prune_if_configured();
                        hold = HoldStatus::Captured;
                        captured = Some(path);
                    },
                    Err(e) => {
                        warn!("Could not export face {:?}: {:?}", face, e);
                        hold = self.state_machine.export_failed(now);
                    }
                }
            }
        }
        self.session.hold_start_time = self.state_machine.hold_start();

        if self.config.annotate {
            let annotations: Vec<FaceAnnotation> = face_results.iter()
                .map(|r| FaceAnnotation{face: r.face, intensity: r.intensity})
                .collect();
            annotate(&mut image, &annotations, best_face.as_ref(), &hold,
                     self.config.hold_duration, self.session.best_intensity_seen);
        }

        self.session.frames_processed += 1;
        self.frame_latency.add(process_start.elapsed());
        debug!("Frame {}: {} face(s), max intensity {:.1}, {:?}",
               frame_id, face_results.len(), max_intensity, hold);
        FrameResult{frame_id, faces: face_results, max_intensity, hold, captured,
                    display: image}
    }

    // Scores one face on a budgeted worker. None if the face's crop is empty
    // or the budget expired.
    fn score_face(&mut self, full_gray: &image::GrayImage, face: &FaceBox)
                  -> Option<SmileAnalysis> {
        let crop = crop_gray(full_gray, face)?;
        let score_start = Instant::now();
        let analysis = score_with_budget(&self.scorer, equalize(&crop),
                                         self.config.score_budget);
        self.score_latency.add(score_start.elapsed());
        if analysis.is_none() {
            self.scores_over_budget += 1;
        }
        analysis
    }

    fn prune_if_configured(&self) {
        if !self.config.prune_old_captures {
            return;
        }
        if let Err(e) = self.exporter.prune() {
            warn!("Could not prune old captures: {:?}", e);
        }
    }

    fn log_stats(&self) {
        info!("Processed {} frame(s); best intensity {:.1}",
              self.session.frames_processed, self.session.best_intensity_seen);
        if self.session.frames_processed > 0 {
            info!("Frame latency: {}", self.frame_latency.session);
        }
        if self.score_latency.session.count > 0 {
            info!("Scoring latency: {}; {} over budget",
                  self.score_latency.session, self.scores_over_budget);
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.frame_source.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{GrayImage, Rgb};
    use smile_elements::detector_trait::DetectParams;
    use smile_elements::frame_source_trait::ChannelOrder;
    use super::*;
    use crate::image_camera::ImageCamera;

    struct FixedDetector {
        boxes: Vec<FaceBox>,
    }

    impl DetectorTrait for FixedDetector {
        fn detect_multi_scale(&self, image: &GrayImage, _params: &DetectParams)
                              -> Vec<FaceBox> {
            if image.width() == 0 || image.height() == 0 {
                return Vec::new();
            }
            self.boxes.clone()
        }
        fn window_size(&self) -> (u32, u32) { (24, 24) }
    }

    fn engine(dir: &Path, faces: Vec<FaceBox>, smiles: Vec<FaceBox>) -> CaptureEngine {
        let config = SessionConfig{output_directory: dir.to_path_buf(),
                                   score_budget: Duration::from_secs(5),
                                   ..Default::default()};
        let camera = ImageCamera::new(vec![RgbImage::from_pixel(
            640, 480, Rgb([120, 110, 100]))]).unwrap();
        CaptureEngine::new(config, Box::new(camera),
                           Arc::new(FixedDetector{boxes: faces}),
                           Arc::new(FixedDetector{boxes: smiles})).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(640, 480, Rgb([120, 110, 100])),
                   ChannelOrder::Rgb, 0)
    }

    #[test]
    fn test_invalid_config() {
        let config = SessionConfig{face_scale: 2.0, ..Default::default()};
        let camera = ImageCamera::new(vec![RgbImage::new(8, 8)]).unwrap();
        let detector = Arc::new(FixedDetector{boxes: vec![]});
        assert!(CaptureEngine::new(config, Box::new(camera),
                                   detector.clone(), detector).is_err());
    }

    #[test]
    fn test_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), vec![], vec![]);
        let result = engine.process_frame(frame(), Instant::now());
        assert!(result.faces.is_empty());
        assert_eq!(result.max_intensity, 0.0);
        assert_eq!(result.hold, HoldStatus::Idle);
        assert_eq!(result.display.dimensions(), (640, 480));
        assert!(!engine.session_state().faces_seen);
    }

    #[test]
    fn test_face_scored_and_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        // One detection on the downscaled frame: 60x60 at (30, 30), i.e.
        // 100x100 at (50, 50) at full resolution. A 20x10 smile scores
        // 40 + 200 / 50 * 3 = 52.
        let mut engine = engine(dir.path(), vec![FaceBox::new(30, 30, 60, 60)],
                                vec![FaceBox::new(0, 0, 20, 10)]);
        let result = engine.process_frame(frame(), Instant::now());
        // Both localizer passes report the face; the duplicate is kept.
        assert_eq!(result.faces.len(), 2);
        assert_eq!(result.faces[0].face, FaceBox::new(50, 50, 100, 100));
        assert!((result.max_intensity - 52.0).abs() < 1e-9);
        assert_eq!(result.hold, HoldStatus::Idle);
        assert!(engine.session_state().faces_seen);
        assert!((engine.session_state().best_intensity_seen - 52.0).abs() < 1e-9);
        assert_eq!(engine.session_state().frames_processed, 1);
    }

    #[test]
    fn test_capture_after_hold() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), vec![FaceBox::new(30, 30, 60, 60)],
                                vec![FaceBox::new(0, 0, 60, 40)]);
        let t0 = Instant::now();
        let mut captured = Vec::new();
        for i in 0..10 {
            let now = t0 + Duration::from_millis(500 * i);
            let result = engine.process_frame(frame(), now);
            assert_eq!(result.max_intensity, 100.0);
            if i < 6 {
                assert!(matches!(result.hold, HoldStatus::Holding{..}), "{:?}", result.hold);
            }
            if let Some(path) = result.captured {
                captured.push((i, path));
            }
        }
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, 6);
        assert!(captured[0].1.exists());
        assert_eq!(engine.session_state().captured_output_path.as_ref(),
                   Some(&captured[0].1));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_export_failure_retried() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the output directory should be.
        let output_dir = dir.path().join("captures");
        std::fs::File::create(&output_dir).unwrap();
        let mut engine = engine(&output_dir, vec![FaceBox::new(30, 30, 60, 60)],
                                vec![FaceBox::new(0, 0, 60, 40)]);
        let t0 = Instant::now();
        engine.process_frame(frame(), t0);
        let result = engine.process_frame(frame(), t0 + Duration::from_secs(3));
        assert!(result.captured.is_none());
        assert_eq!(result.hold, HoldStatus::Holding{elapsed: Duration::from_secs(3),
                                                    remaining: Duration::ZERO});
        assert_eq!(engine.session_state().hold_start_time, Some(t0));
        assert!(engine.session_state().captured_output_path.is_none());

        // Still blocked: the hold survives another failed attempt.
        let result = engine.process_frame(frame(), t0 + Duration::from_millis(3100));
        assert!(result.captured.is_none());
        assert_eq!(engine.session_state().hold_start_time, Some(t0));

        // Once the path is writable the next frame exports.
        std::fs::remove_file(&output_dir).unwrap();
        let result = engine.process_frame(frame(), t0 + Duration::from_millis(3200));
        assert_eq!(result.hold, HoldStatus::Captured);
        let path = result.captured.unwrap();
        assert!(path.starts_with(&output_dir));
        assert!(path.exists());
        assert_eq!(engine.session_state().hold_start_time, None);
        assert_eq!(engine.session_state().captured_output_path, Some(path));
    }

    #[test]
    fn test_run_releases_camera_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), vec![], vec![]);
        let cancel = AtomicBool::new(true);
        assert!(matches!(engine.run(&cancel), SessionOutcome::Cancelled));
        assert!(engine.frame_source().is_released());
        assert_eq!(engine.session_state().frames_processed, 0);
    }

    #[test]
    fn test_display_callback_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), vec![], vec![]);
        let cancel = AtomicBool::new(false);
        let mut frames_shown = 0;
        let outcome = engine.run_with_display(&cancel, |display| {
            assert_eq!(display.dimensions(), (640, 480));
            frames_shown += 1;
            frames_shown < 3
        });
        assert!(matches!(outcome, SessionOutcome::Cancelled));
        assert_eq!(frames_shown, 3);
        assert!(engine.frame_source().is_released());
    }

}  // mod tests.
