// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use canonical_error::CanonicalError;
use clap::Parser;
use log::{error, info};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use smile_capture::capture_engine::{CaptureEngine, SessionOutcome};
use smile_capture::config::{FACE_MODEL_FILE, SMILE_MODEL_FILE, SessionConfig};
use smile_capture::exporter::Exporter;
use smile_capture::haar_cascade::HaarCascade;
use smile_capture::image_camera::ImageCamera;
use smile_elements::frame_source_trait::FrameSourceTrait;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Give up if no capture has happened after this many seconds.
    #[arg(long, value_parser = parse_duration, default_value = "30")]
    timeout: Duration,

    /// Directory to write the captured face image to. Created if needed.
    #[arg(long, default_value = "smile_captures")]
    output_dir: PathBuf,

    /// Seconds the smile must be held above threshold.
    #[arg(long, value_parser = parse_duration, default_value = "3.0")]
    hold_duration: Duration,

    /// Smile intensity (0..100) that must be held.
    #[arg(long, default_value = "98")]
    threshold: f64,

    /// Directory containing haarcascade_frontalface_default.xml and
    /// haarcascade_smile.xml.
    #[arg(long, default_value = "/usr/share/opencv4/haarcascades")]
    model_dir: PathBuf,

    /// Webcam to use.
    #[arg(long, default_value = "0")]
    camera_index: u32,

    /// Test image to use instead of camera.
    #[arg(long)]
    test_image: Option<PathBuf>,

    /// Per-face smile scoring budget, milliseconds.
    #[arg(long, default_value = "200")]
    score_budget_ms: u64,

    /// Do not mirror frames horizontally.
    #[arg(long)]
    no_mirror: bool,

    /// After a capture, delete older captures from the output directory.
    #[arg(long)]
    prune_old_captures: bool,

    /// Captures are named <file_prefix>_<YYYYMMDD_HHMMSS>.<file_extension>.
    #[arg(long, default_value = "face")]
    file_prefix: String,

    /// png, jpg, jpeg, bmp or tiff.
    #[arg(long, default_value = "png")]
    file_extension: String,

    /// Print the most recent capture in the output directory and exit.
    #[arg(long)]
    latest: bool,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "smile_capture_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str) -> Result<Duration, String> {
    let seconds: f64 = arg.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("{} is not a non-negative number of seconds", arg))
}

fn open_frame_source(args: &Args) -> Result<Box<dyn FrameSourceTrait>, CanonicalError> {
    if let Some(test_image) = &args.test_image {
        // Emulate a 30fps camera.
        let camera = ImageCamera::from_file(test_image)?
            .with_frame_interval(Duration::from_millis(33));
        return Ok(Box::new(camera));
    }
    open_webcam(args.camera_index)
}

#[cfg(feature = "webcam")]
fn open_webcam(index: u32) -> Result<Box<dyn FrameSourceTrait>, CanonicalError> {
    Ok(Box::new(smile_capture::webcam::Webcam::open(index)?))
}

#[cfg(not(feature = "webcam"))]
fn open_webcam(index: u32) -> Result<Box<dyn FrameSourceTrait>, CanonicalError> {
    Err(canonical_error::unimplemented_error(
        &format!("Camera {} requested but webcam support is not built in; \
                  rebuild with --features webcam or pass --test_image", index)))
}

fn run(args: Args, got_signal: Arc<AtomicBool>) -> Result<SessionOutcome, CanonicalError> {
    let face_detector = Arc::new(HaarCascade::from_file(&args.model_dir.join(FACE_MODEL_FILE))?);
    let smile_detector = Arc::new(HaarCascade::from_file(&args.model_dir.join(SMILE_MODEL_FILE))?);
    let config = SessionConfig{
        timeout: args.timeout,
        output_directory: args.output_dir.clone(),
        hold_duration: args.hold_duration,
        capture_threshold: args.threshold,
        score_budget: Duration::from_millis(args.score_budget_ms),
        mirror: !args.no_mirror,
        prune_old_captures: args.prune_old_captures,
        file_prefix: args.file_prefix.clone(),
        file_extension: args.file_extension.clone(),
        ..Default::default()
    };
    config.validate()?;
    let frame_source = open_frame_source(&args)?;
    let mut engine = CaptureEngine::new(config, frame_source, face_detector, smile_detector)?;
    info!("Smile for {:?} to capture! Press control-c to cancel.", args.hold_duration);
    Ok(engine.run(&got_signal))
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    if args.latest {
        let exporter = Exporter::new(&args.output_dir, &args.file_prefix,
                                     &args.file_extension);
        return match exporter.latest() {
            Some(path) => {
                println!("{}", path.display());
                ExitCode::SUCCESS
            },
            None => {
                info!("No captures in {:?}", args.output_dir);
                ExitCode::FAILURE
            }
        };
    }

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        error!("Could not install control-c handler: {:?}", e);
    }

    match run(args, got_signal) {
        Ok(SessionOutcome::Captured(path)) => {
            println!("{}", path.display());
            ExitCode::SUCCESS
        },
        Ok(SessionOutcome::Cancelled) => ExitCode::from(1),
        Ok(SessionOutcome::TimedOut{faces_seen}) => {
            if !faces_seen {
                info!("No face was detected; check lighting and camera placement");
            }
            ExitCode::from(1)
        },
        Ok(SessionOutcome::CameraFailed(e)) => {
            error!("Camera failed: {}", e.message);
            ExitCode::from(2)
        },
        Err(e) => {
            error!("{:?}", e);
            ExitCode::from(2)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3.0"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("inf").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let result = Args::try_parse_from(["smile-capture", "--timeout=-1"]);
        assert!(result.is_err());
        let args = Args::try_parse_from(["smile-capture", "--timeout", "5"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(5));
    }

}  // mod tests.
