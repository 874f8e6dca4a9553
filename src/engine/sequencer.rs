use super::classifier::{FrameCategory, FrameClassifier, UnexpectedFrame};
use super::report::{RunOutcome, RunReport, RunWarning};
use super::state::{AbortReason, RunPhase};
use crate::background::{BackgroundAccumulator, BackgroundMedianCache, CacheLookup};
use crate::core::{FrameEvent, Image, RunConfig};
use crate::observability::RunMetrics;
use crate::storage::{frame_file_name, median_file_name, FrameWriter, Product};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

/// Abort an armed run that sees no trigger for this long. The detector drops
/// into free-run after ~20 s of trigger silence, so this must stay below that.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Frames a run holds on to until finalizing
#[derive(Default)]
struct RunState {
    frames_received: u64,
    background: BackgroundAccumulator,
    data_frames: Vec<(u64, Image)>,
}

enum ArmedEvent {
    Frame(Option<FrameEvent>),
    Cancelled,
    TimedOut,
}

/// Drives one acquisition run from arming to completion or abort
pub struct AcquisitionSequencer {
    config: RunConfig,
    classifier: FrameClassifier,
    writer: Arc<dyn FrameWriter>,
    cache: Arc<BackgroundMedianCache>,
    idle_timeout: Duration,
    phase: RunPhase,
    state: RunState,
    metrics: Arc<RunMetrics>,
    saved_frames: Vec<PathBuf>,
    median_file: Option<PathBuf>,
    subtracted_files: Vec<PathBuf>,
    warnings: Vec<RunWarning>,
}

impl AcquisitionSequencer {
    pub fn new(
        config: RunConfig,
        writer: Arc<dyn FrameWriter>,
        cache: Arc<BackgroundMedianCache>,
    ) -> Self {
        let classifier = FrameClassifier::new(&config);
        let metrics = Arc::new(RunMetrics::new(config.run_name.clone()));
        Self {
            config,
            classifier,
            writer,
            cache,
            idle_timeout: IDLE_TIMEOUT,
            phase: RunPhase::Armed { armed_at: None },
            state: RunState::default(),
            metrics,
            saved_frames: Vec::new(),
            median_file: None,
            subtracted_files: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    /// Abort a run that is cancelled before its frame source starts
    pub fn cancel(self) -> Result<RunReport> {
        self.abort(AbortReason::Cancelled)
    }

    fn transition_to(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(&next) {
            return Err(anyhow!(
                "Invalid run transition: {} -> {}",
                self.phase.name(),
                next.name()
            ));
        }
        self.phase = next;
        Ok(())
    }

    /// Consume frame events until the run completes or aborts.
    ///
    /// Only the wait for the first frame is bounded by the idle timeout. If the
    /// first frame and the timeout become ready together, the frame wins.
    /// A message on `shutdown` aborts without finalizing.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<FrameEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RunReport> {
        let total = self.classifier.expected_total();
        let b = self.classifier.boundaries();
        self.phase = RunPhase::Armed {
            armed_at: Some(Instant::now()),
        };
        info!(
            "Run {} armed: {} frames expected (skip {}, background {}, data {}, post-background {}), gain {}",
            self.config.run_name,
            total,
            b.skip_end,
            b.background_end - b.skip_end,
            b.data_end - b.background_end,
            b.post_background_end - b.data_end,
            self.config.gain
        );

        let idle_timeout = self.idle_timeout;
        let event = tokio::select! {
            biased;
            frame = frames.recv() => ArmedEvent::Frame(frame),
            _ = cancelled(&mut shutdown) => ArmedEvent::Cancelled,
            _ = sleep(idle_timeout) => ArmedEvent::TimedOut,
        };

        let first = match event {
            ArmedEvent::Frame(Some(frame)) => frame,
            ArmedEvent::Frame(None) => {
                return self.abort(AbortReason::FrameSourceClosed {
                    received: 0,
                    expected: total,
                })
            }
            ArmedEvent::Cancelled => return self.abort(AbortReason::Cancelled),
            ArmedEvent::TimedOut => return self.abort(AbortReason::NoTriggerTimeout),
        };

        self.handle_frame(first).await;
        self.transition_to(RunPhase::Collecting {
            frames_received: self.state.frames_received,
        })?;

        while self.state.frames_received < total {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => None,
                frame = frames.recv() => Some(frame),
            };

            match next {
                None => return self.abort(AbortReason::Cancelled),
                Some(Some(frame)) => {
                    self.handle_frame(frame).await;
                    self.transition_to(RunPhase::Collecting {
                        frames_received: self.state.frames_received,
                    })?;
                }
                Some(None) => {
                    let received = self.state.frames_received;
                    return self.abort(AbortReason::FrameSourceClosed {
                        received,
                        expected: total,
                    });
                }
            }
        }

        self.transition_to(RunPhase::Finalizing)?;
        self.finalize().await;

        // Triggers that arrived after the expected total are kept as extras
        while let Ok(frame) = frames.try_recv() {
            self.handle_frame(frame).await;
        }

        self.transition_to(RunPhase::Complete {
            total_frames: self.state.frames_received,
        })?;
        info!(
            "Run {} complete: {} frames, {} subtracted, {} warnings",
            self.config.run_name,
            self.state.frames_received,
            self.subtracted_files.len(),
            self.warnings.len()
        );

        Ok(self.report(RunOutcome::Complete))
    }

    async fn handle_frame(&mut self, frame: FrameEvent) {
        let ordinal = self.state.frames_received + 1;
        if frame.ordinal != ordinal {
            debug!(
                "Driver ordinal {} differs from arrival count {}",
                frame.ordinal, ordinal
            );
        }
        self.state.frames_received = ordinal;

        let class = match self.classifier.classify(ordinal) {
            Ok(class) => class,
            Err(unexpected) => return self.save_extra(unexpected, frame.image).await,
        };

        self.metrics.record_frame(Some(class.category));
        debug!(
            "Frame {} of run {}: {:?}{}",
            ordinal,
            self.config.run_name,
            class.category,
            if class.is_shot_frame { " (shot)" } else { "" }
        );

        let name = frame_file_name(&self.config.run_name, ordinal, Product::Raw(class));
        if let Some(path) = self.save(name, &frame.image).await {
            self.saved_frames.push(path);
        }

        match class.category {
            FrameCategory::Background => {
                if let Err(e) = self.state.background.add(frame.image) {
                    self.warn(RunWarning::BackgroundRejected {
                        ordinal,
                        error: e.to_string(),
                    });
                }
            }
            FrameCategory::Data => self.state.data_frames.push((ordinal, frame.image)),
            FrameCategory::Skip | FrameCategory::PostBackground => {}
        }
    }

    async fn save_extra(&mut self, unexpected: UnexpectedFrame, image: Image) {
        self.metrics.record_frame(None);
        self.warn(RunWarning::UnexpectedFrame(unexpected));

        let name = frame_file_name(&self.config.run_name, unexpected.ordinal, Product::Extra);
        if let Some(path) = self.save(name, &image).await {
            self.saved_frames.push(path);
        }
    }

    async fn finalize(&mut self) {
        let gain = self.config.gain;
        let mut gain_mismatch = false;

        let median = if !self.state.background.is_empty() {
            match self.state.background.compute_median() {
                Ok(median) => {
                    let name = median_file_name(&self.config.run_name);
                    self.median_file = self.save(name, &median).await;

                    let cache = self.cache.clone();
                    let entry = median.clone();
                    let persisted =
                        tokio::task::spawn_blocking(move || cache.persist(&entry, gain)).await;
                    match persisted {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.warn(RunWarning::CachePersistFailed(e.to_string())),
                        Err(e) => self.warn(RunWarning::CachePersistFailed(e.to_string())),
                    }
                    Some(median)
                }
                Err(e) => {
                    self.warn(RunWarning::MedianFailed(e.to_string()));
                    None
                }
            }
        } else if !self.state.data_frames.is_empty() {
            let cache = self.cache.clone();
            match tokio::task::spawn_blocking(move || cache.lookup(gain)).await {
                Ok(Ok(CacheLookup::Hit(median))) => {
                    info!("Using cached background median (gain {})", gain);
                    Some(median)
                }
                Ok(Ok(CacheLookup::GainMismatch { cached_gain })) => {
                    gain_mismatch = true;
                    self.warn(RunWarning::GainMismatch {
                        cached_gain,
                        run_gain: gain,
                    });
                    None
                }
                Ok(Ok(CacheLookup::Missing)) => None,
                Ok(Err(e)) => {
                    warn!("Background cache unreadable: {}", e);
                    None
                }
                Err(e) => {
                    warn!("Background cache lookup did not finish: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if self.state.data_frames.is_empty() {
            return;
        }

        let Some(median) = median else {
            if !gain_mismatch {
                self.warn(RunWarning::NoBackgroundAvailable);
            }
            return;
        };

        let data_frames = std::mem::take(&mut self.state.data_frames);
        for (ordinal, frame) in data_frames {
            match frame.subtract(&median) {
                Ok(subtracted) => {
                    let name = frame_file_name(&self.config.run_name, ordinal, Product::Subtracted);
                    if let Some(path) = self.save(name, &subtracted).await {
                        self.subtracted_files.push(path);
                    }
                }
                Err(e) => self.warn(RunWarning::SubtractionFailed {
                    ordinal,
                    error: e.to_string(),
                }),
            }
        }
    }

    async fn save(&mut self, file_name: String, image: &Image) -> Option<PathBuf> {
        match self.writer.write(&file_name, image).await {
            Ok(path) => {
                self.metrics.record_write(true);
                Some(path)
            }
            Err(e) => {
                self.metrics.record_write(false);
                self.warn(RunWarning::WriteFailed {
                    file_name,
                    error: format!("{:#}", e),
                });
                None
            }
        }
    }

    fn warn(&mut self, warning: RunWarning) {
        warn!("Run {}: {}", self.config.run_name, warning);
        self.warnings.push(warning);
    }

    fn abort(mut self, reason: AbortReason) -> Result<RunReport> {
        warn!("Run {} aborted: {}", self.config.run_name, reason);
        self.transition_to(RunPhase::Aborted {
            reason: reason.clone(),
        })?;
        Ok(self.report(RunOutcome::Aborted(reason)))
    }

    fn report(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_name: self.config.run_name.clone(),
            run_dir: self.writer.directory().to_path_buf(),
            outcome,
            frames_expected: self.classifier.expected_total(),
            frames_received: self.state.frames_received,
            saved_frames: self.saved_frames,
            median_file: self.median_file,
            subtracted_files: self.subtracted_files,
            warnings: self.warnings,
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Resolves on a shutdown signal; a dropped sender never cancels
async fn cancelled(shutdown: &mut broadcast::Receiver<()>) {
    match shutdown.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
}
