// src/pipeline.rs
//
// The controller: drives capture -> infer -> annotate -> push -> pace as a
// single sequential loop and owns the session lifecycle. Inference and
// annotation failures degrade the frame; encoder failures end the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::annotate::annotate;
use crate::capture::{Capture, VideoSource};
use crate::detector::{Detector, YoloDetector};
use crate::error::{PipelineError, StreamError};
use crate::metrics::{MetricsSnapshot, PipelineMetrics, SystemSampler};
use crate::preview::Preview;
use crate::streamer::{FrameSink, StreamEncoder};
use crate::types::{Config, Frame, FrameOutcome, PacingMode};

/// Session lifecycle. Monotonic: no state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Closed,
}

/// What ended the `Running` loop. All three drain through the same one-shot
/// cleanup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Signal,
    StreamFailure,
}

#[derive(Debug)]
pub struct SessionReport {
    pub frames_captured: u64,
    pub frames_pushed: u64,
    pub frames_degraded: u64,
    pub stop: StopReason,
}

/// Cancellation token shared with the signal handler. Setting it twice is
/// harmless; the controller only reads it at iteration boundaries.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn install_signal_handler(shutdown: &ShutdownFlag) {
    let flag = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Termination signal received, shutting down");
        flag.request();
    }) {
        warn!("Failed to install signal handler: {err}");
    }
}

/// Post-push frame pacing.
pub struct Pacer {
    interval: Duration,
    mode: PacingMode,
    last: Instant,
}

impl Pacer {
    pub fn new(fps: u32, mode: PacingMode) -> Self {
        Self {
            interval: Self::interval(fps),
            mode,
            last: Instant::now(),
        }
    }

    /// Requested inter-frame sleep: `1/fps` seconds, i.e. `1000/fps` ms.
    pub fn interval(fps: u32) -> Duration {
        Duration::from_secs_f64(1.0 / fps as f64)
    }

    pub fn pause(&mut self) {
        match self.mode {
            // Legacy parity: the full interval regardless of processing time.
            PacingMode::Fixed => thread::sleep(self.interval),
            PacingMode::Deadline => {
                let elapsed = self.last.elapsed();
                if elapsed < self.interval {
                    thread::sleep(self.interval - elapsed);
                }
                self.last = Instant::now();
            }
        }
    }
}

/// Wire the real components and run one streaming session.
pub fn run(config: &Config) -> Result<SessionReport, PipelineError> {
    let shutdown = ShutdownFlag::default();
    install_signal_handler(&shutdown);

    // Model and device state load once, before the pipeline starts.
    let detector = YoloDetector::new(&config.model).map_err(PipelineError::Init)?;
    let mut sampler = SystemSampler::new();

    let preview = if config.video.show_preview {
        match Preview::open() {
            Ok(preview) => Some(preview),
            Err(err) => {
                warn!("Preview unavailable, continuing without it: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let url = config.stream.url();
    let fps = config.video.fps;
    let settings = config.encoder.clone();

    run_session(
        config,
        || Capture::open(&config.source).map_err(PipelineError::from),
        detector,
        |width, height| StreamEncoder::open(width, height, fps, &url, &settings),
        &mut sampler,
        preview,
        shutdown,
    )
}

/// The lifecycle state machine, generic over its collaborators so every
/// shutdown scenario is testable without devices or child processes.
///
/// An `Err` here means initialization never completed (the state machine
/// never reached `Running`); every later failure drains through cleanup and
/// comes back as an `Ok` report.
pub fn run_session<S, D, K>(
    config: &Config,
    open_source: impl FnOnce() -> Result<S, PipelineError>,
    mut detector: D,
    open_sink: impl FnOnce(u32, u32) -> Result<K, StreamError>,
    sampler: &mut SystemSampler,
    mut preview: Option<Preview>,
    shutdown: ShutdownFlag,
) -> Result<SessionReport, PipelineError>
where
    S: VideoSource,
    D: Detector,
    K: FrameSink,
{
    let mut state = PipelineState::Initializing;
    debug!(?state, "Pipeline starting");

    // Capture must open before the encoder is ever spawned.
    let mut source = open_source()?;
    let (width, height) = source.resolution();
    let mut sink = open_sink(width, height)?;

    state = PipelineState::Running;
    info!(?state, width, height, fps = config.video.fps, "Pipeline running");

    let metrics = PipelineMetrics::new();
    let mut pacer = Pacer::new(config.video.fps, config.video.pacing);

    let stop = loop {
        if shutdown.is_requested() {
            break StopReason::Signal;
        }

        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break StopReason::EndOfStream,
            Err(err) => {
                warn!("Capture read failed, treating as end of stream: {err}");
                break StopReason::EndOfStream;
            }
        };
        metrics.inc(&metrics.frames_captured);

        let snapshot = sampler.snapshot();
        let annotated = match process_frame(&frame, &mut detector, &snapshot) {
            FrameOutcome::Annotated(frame) => frame,
            FrameOutcome::Degraded { frame, reason } => {
                warn!("Frame {} degraded: {}", frame.index, reason);
                metrics.inc(&metrics.frames_degraded);
                frame
            }
        };

        if let Some(window) = preview.as_mut() {
            match window.show(&annotated) {
                Ok(true) => shutdown.request(),
                Ok(false) => {}
                Err(err) => warn!("Preview render failed: {err:#}"),
            }
        }

        if let Err(err) = sink.push(&annotated) {
            error!("Stream write failed: {err}");
            break StopReason::StreamFailure;
        }
        metrics.inc(&metrics.frames_pushed);

        pacer.pause();
    };

    state = PipelineState::Draining;
    info!(?state, ?stop, "Pipeline draining");

    // One-shot cleanup; each step is individually no-op safe.
    source.release();
    sink.close();
    if let Some(mut window) = preview.take() {
        window.close();
    }

    state = PipelineState::Closed;
    let summary = metrics.summary();
    info!(
        ?state,
        frames = summary.frames_pushed,
        degraded = summary.frames_degraded,
        avg_fps = format!("{:.1}", summary.avg_fps),
        elapsed_secs = format!("{:.1}", summary.elapsed_secs),
        "Pipeline closed"
    );

    Ok(SessionReport {
        frames_captured: summary.frames_captured,
        frames_pushed: summary.frames_pushed,
        frames_degraded: summary.frames_degraded,
        stop,
    })
}

/// Per-frame processing. Never fails: inference errors fall back to an
/// empty detection list (metrics overlay still applies) and annotation
/// errors fall back to the unmodified frame, both reported as `Degraded`.
fn process_frame<D: Detector>(
    frame: &Frame,
    detector: &mut D,
    snapshot: &MetricsSnapshot,
) -> FrameOutcome {
    let (detections, inference_failure) = match detector.infer(frame) {
        Ok(detections) => (detections, None),
        Err(err) => (Vec::new(), Some(err)),
    };

    match annotate(frame, &detections, snapshot) {
        Ok(annotated) => match inference_failure {
            None => FrameOutcome::Annotated(annotated),
            Some(err) => FrameOutcome::Degraded {
                frame: annotated,
                reason: format!("inference failed: {err:#}"),
            },
        },
        Err(err) => FrameOutcome::Degraded {
            frame: frame.clone(),
            reason: format!("annotation failed: {err:#}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use crate::types::{
        BoundingBox, Detection, EncoderSettings, ModelConfig, SourceId, StreamConfig, VideoConfig,
    };
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const W: u32 = 64;
    const H: u32 = 48;

    fn test_config() -> Config {
        Config {
            source: SourceId::Device(0),
            stream: StreamConfig {
                host: "localhost".to_string(),
                port: 8554,
                path: "test".to_string(),
                url_override: None,
            },
            model: ModelConfig {
                path: "model.onnx".to_string(),
                device: "cpu".to_string(),
                confidence_threshold: 0.25,
            },
            video: VideoConfig {
                fps: 1000,
                show_preview: false,
                pacing: PacingMode::Fixed,
            },
            encoder: EncoderSettings::default(),
        }
    }

    fn good_frame(index: u64) -> Frame {
        Frame {
            data: vec![0u8; (W * H * 3) as usize],
            width: W,
            height: H,
            index,
        }
    }

    /// Frame whose buffer does not match its dimensions, so annotation fails.
    fn malformed_frame(index: u64) -> Frame {
        Frame {
            data: vec![0u8; 3],
            width: W,
            height: H,
            index,
        }
    }

    struct StubSource {
        frames: Vec<Frame>,
        cursor: usize,
        releases: Rc<Cell<u32>>,
    }

    impl StubSource {
        fn new(frames: Vec<Frame>, releases: Rc<Cell<u32>>) -> Self {
            Self {
                frames,
                cursor: 0,
                releases,
            }
        }
    }

    impl VideoSource for StubSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let frame = self.frames.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(frame)
        }

        fn resolution(&self) -> (u32, u32) {
            (W, H)
        }

        fn release(&mut self) {
            self.releases.set(self.releases.get() + 1);
        }
    }

    struct StubDetector {
        fail_on: Option<u64>,
    }

    impl Detector for StubDetector {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            if self.fail_on == Some(frame.index) {
                anyhow::bail!("model exploded");
            }
            Ok(vec![Detection {
                label: "person".to_string(),
                confidence: 0.9,
                bbox: BoundingBox::from_corners(2.0, 2.0, 10.0, 10.0),
            }])
        }
    }

    #[derive(Default)]
    struct SinkLog {
        pushed: RefCell<Vec<u64>>,
        closes: Cell<u32>,
    }

    struct StubSink {
        log: Rc<SinkLog>,
        fail_on_push: Option<usize>,
        shutdown_on_push: Option<(ShutdownFlag, usize)>,
    }

    impl FrameSink for StubSink {
        fn push(&mut self, frame: &Frame) -> Result<(), StreamError> {
            let next = self.log.pushed.borrow().len() + 1;
            if self.fail_on_push == Some(next) {
                return Err(StreamError::BrokenPipe);
            }
            self.log.pushed.borrow_mut().push(frame.index);
            if let Some((flag, at)) = &self.shutdown_on_push {
                if *at == next {
                    flag.request();
                }
            }
            Ok(())
        }

        fn close(&mut self) {
            self.log.closes.set(self.log.closes.get() + 1);
        }
    }

    fn run_with(
        frames: Vec<Frame>,
        detector: StubDetector,
        fail_on_push: Option<usize>,
        shutdown_on_push: Option<usize>,
    ) -> (SessionReport, Rc<Cell<u32>>, Rc<SinkLog>) {
        let releases = Rc::new(Cell::new(0));
        let log = Rc::new(SinkLog::default());
        let shutdown = ShutdownFlag::default();
        let sink = StubSink {
            log: log.clone(),
            fail_on_push,
            shutdown_on_push: shutdown_on_push.map(|at| (shutdown.clone(), at)),
        };
        let source = StubSource::new(frames, releases.clone());
        let mut sampler = SystemSampler::new();

        let report = run_session(
            &test_config(),
            || Ok(source),
            detector,
            |_, _| Ok(sink),
            &mut sampler,
            None,
            shutdown,
        )
        .unwrap();

        (report, releases, log)
    }

    #[test]
    fn test_five_frames_then_end_of_stream() {
        let frames = (0..5).map(good_frame).collect();
        let (report, releases, log) =
            run_with(frames, StubDetector { fail_on: None }, None, None);

        assert_eq!(report.stop, StopReason::EndOfStream);
        assert_eq!(report.frames_pushed, 5);
        assert_eq!(report.frames_degraded, 0);
        assert_eq!(*log.pushed.borrow(), vec![0, 1, 2, 3, 4]);
        assert_eq!(releases.get(), 1);
        assert_eq!(log.closes.get(), 1);
    }

    #[test]
    fn test_stream_failure_drains_exactly_once() {
        let frames = (0..10).map(good_frame).collect();
        let (report, releases, log) =
            run_with(frames, StubDetector { fail_on: None }, Some(4), None);

        assert_eq!(report.stop, StopReason::StreamFailure);
        assert_eq!(report.frames_pushed, 3);
        assert_eq!(releases.get(), 1, "source released exactly once");
        assert_eq!(log.closes.get(), 1, "sink closed exactly once");
    }

    #[test]
    fn test_signal_completes_in_flight_push() {
        let frames = (0..10).map(good_frame).collect();
        let (report, releases, log) =
            run_with(frames, StubDetector { fail_on: None }, None, Some(2));

        assert_eq!(report.stop, StopReason::Signal);
        assert_eq!(report.frames_pushed, 2, "in-flight frame still pushed");
        assert_eq!(releases.get(), 1);
        assert_eq!(log.closes.get(), 1);
    }

    #[test]
    fn test_inference_failure_degrades_but_continues() {
        let frames = (0..3).map(good_frame).collect();
        let (report, _, log) =
            run_with(frames, StubDetector { fail_on: Some(1) }, None, None);

        assert_eq!(report.stop, StopReason::EndOfStream);
        assert_eq!(report.frames_pushed, 3, "degraded frame is still forwarded");
        assert_eq!(report.frames_degraded, 1);
        assert_eq!(*log.pushed.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_annotation_failure_does_not_affect_next_frame() {
        let frames = vec![good_frame(0), malformed_frame(1), good_frame(2)];
        let (report, _, log) =
            run_with(frames, StubDetector { fail_on: None }, None, None);

        assert_eq!(report.frames_pushed, 3);
        assert_eq!(report.frames_degraded, 1);
        assert_eq!(*log.pushed.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_capture_open_failure_never_spawns_encoder() {
        let sink_opened = Rc::new(Cell::new(false));
        let opened = sink_opened.clone();
        let mut sampler = SystemSampler::new();

        let result = run_session(
            &test_config(),
            || {
                Err::<StubSource, _>(PipelineError::Capture(CaptureError::Open {
                    source: "0".to_string(),
                    reason: "no such device".to_string(),
                }))
            },
            StubDetector { fail_on: None },
            |_, _| {
                opened.set(true);
                Ok(StubSink {
                    log: Rc::new(SinkLog::default()),
                    fail_on_push: None,
                    shutdown_on_push: None,
                })
            },
            &mut sampler,
            None,
            ShutdownFlag::default(),
        );

        assert!(result.is_err());
        assert!(!sink_opened.get(), "encoder must never be opened");
    }

    #[test]
    fn test_pacing_interval_arithmetic() {
        for fps in [1u32, 5, 15, 24, 30, 60, 120] {
            let interval = Pacer::interval(fps);
            let expected_ms = 1000.0 / fps as f64;
            assert!(
                (interval.as_secs_f64() * 1000.0 - expected_ms).abs() < 1e-9,
                "fps {fps}: expected {expected_ms} ms"
            );
        }
    }

    #[test]
    fn test_process_frame_annotates() {
        let snapshot = MetricsSnapshot {
            cpu_percent: 10.0,
            mem_percent: 20.0,
        };
        let mut detector = StubDetector { fail_on: None };
        match process_frame(&good_frame(0), &mut detector, &snapshot) {
            FrameOutcome::Annotated(frame) => {
                assert_eq!(frame.width, W);
                assert_eq!(frame.data.len(), frame.byte_len());
            }
            FrameOutcome::Degraded { reason, .. } => panic!("unexpected degradation: {reason}"),
        }
    }

    #[test]
    fn test_process_frame_degrades_on_inference_failure() {
        let snapshot = MetricsSnapshot {
            cpu_percent: 10.0,
            mem_percent: 20.0,
        };
        let mut detector = StubDetector { fail_on: Some(0) };
        match process_frame(&good_frame(0), &mut detector, &snapshot) {
            FrameOutcome::Degraded { frame, reason } => {
                // Partial annotation: the metrics overlay still applies.
                assert_eq!(frame.data.len(), frame.byte_len());
                assert!(reason.contains("inference failed"));
            }
            FrameOutcome::Annotated(_) => panic!("expected degraded outcome"),
        }
    }

    #[test]
    fn test_shutdown_flag_is_sticky() {
        let flag = ShutdownFlag::default();
        assert!(!flag.is_requested());
        flag.request();
        flag.request();
        assert!(flag.is_requested());
    }
}
