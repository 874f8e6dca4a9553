use crate::background::BackgroundMedianCache;
use crate::config::HostSettings;
use crate::core::{ArmCommand, ArmCommandError, RunConfig};
use crate::engine::{AcquisitionSequencer, RunReport};
use crate::hal::{Detector, DetectorSettings};
use crate::protocol::{StatusMessage, ACK_NOT_OK, ACK_OK};
use crate::storage::{FrameWriter, RawFrameWriter, ARM_CONFIG_FILE_NAME};
use crate::transfer::{run_transfer, TransferTrigger};
use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid arm command: {0}")]
    InvalidArm(#[from] ArmCommandError),

    #[error("Run {0} is still in progress")]
    RunAlreadyInProgress(String),

    #[error("Could not prepare run: {0:#}")]
    Setup(anyhow::Error),

    #[error("Link to controller is closed")]
    LinkClosed,
}

type SharedDetector = Arc<tokio::sync::Mutex<Box<dyn Detector>>>;

struct ActiveRun {
    run_name: String,
    cancel_tx: broadcast::Sender<()>,
}

/// Handle to a run started by an accepted arm command
#[derive(Debug)]
pub struct RunHandle {
    pub run_name: String,
    pub run_dir: PathBuf,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Wait for the run, its status message and any local transfer
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| anyhow!("Run task for {} failed: {}", self.run_name, e))?
    }
}

/// Detector-host side of the protocol.
///
/// Accepts arm commands, runs at most one acquisition at a time, and reports
/// back through `status_tx`.
pub struct HostSession {
    settings: HostSettings,
    detector: SharedDetector,
    cache: Arc<BackgroundMedianCache>,
    transfer: Option<Arc<dyn TransferTrigger>>,
    status_tx: mpsc::Sender<Vec<u8>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl HostSession {
    pub fn new(
        settings: HostSettings,
        detector: Box<dyn Detector>,
        cache: Arc<BackgroundMedianCache>,
        status_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            settings,
            detector: Arc::new(tokio::sync::Mutex::new(detector)),
            cache,
            transfer: None,
            status_tx,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Copy finished runs from this host instead of leaving it to the relay
    pub fn with_local_transfer(mut self, transfer: Arc<dyn TransferTrigger>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn is_run_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Abort the current run, if any; returns whether one was running
    pub fn cancel_active_run(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(run) => {
                info!("Cancelling run {}", run.run_name);
                let _ = run.cancel_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Handle one message from the controller.
    ///
    /// Replies `OK` and starts the run, or replies `NOT OK` and returns why.
    pub async fn handle_message(&self, bytes: &[u8]) -> Result<RunHandle, SessionError> {
        let received_at = Instant::now();

        match self.accept(bytes).await {
            Ok(prepared) => {
                self.reply(ACK_OK).await?;
                Ok(self.launch(prepared, received_at))
            }
            Err(e) => {
                warn!("Rejecting arm: {}", e);
                self.reply(ACK_NOT_OK).await?;
                Err(e)
            }
        }
    }

    async fn accept(&self, bytes: &[u8]) -> Result<PreparedRun, SessionError> {
        let arm = ArmCommand::parse(bytes)?;
        let config = arm.validate()?;

        let cancel_rx = {
            let mut active = lock(&self.active);
            if let Some(run) = active.as_ref() {
                return Err(SessionError::RunAlreadyInProgress(run.run_name.clone()));
            }
            let (cancel_tx, cancel_rx) = broadcast::channel(4);
            *active = Some(ActiveRun {
                run_name: config.run_name.clone(),
                cancel_tx,
            });
            cancel_rx
        };

        match self.prepare(&arm, &config).await {
            Ok(writer) => Ok(PreparedRun {
                config,
                writer,
                cancel_rx,
            }),
            Err(e) => {
                *lock(&self.active) = None;
                Err(SessionError::Setup(e))
            }
        }
    }

    async fn prepare(&self, arm: &ArmCommand, config: &RunConfig) -> Result<Arc<RawFrameWriter>> {
        let run_dir = config.run_directory(&self.settings.write_dir);
        let writer = RawFrameWriter::new(run_dir.clone())?;

        let json = serde_json::to_string_pretty(arm)?;
        tokio::fs::write(run_dir.join(ARM_CONFIG_FILE_NAME), json)
            .await
            .with_context(|| format!("Failed to save arm command in {:?}", run_dir))?;

        info!(
            "Armed run {} of {} in {}",
            config.run_name,
            config.experiment,
            run_dir.display()
        );
        Ok(Arc::new(writer))
    }

    fn launch(&self, prepared: PreparedRun, received_at: Instant) -> RunHandle {
        let run_name = prepared.config.run_name.clone();
        let run_dir = prepared.writer.directory().to_path_buf();

        let ctx = RunContext {
            settings: self.settings.clone(),
            detector: self.detector.clone(),
            cache: self.cache.clone(),
            transfer: self.transfer.clone(),
            status_tx: self.status_tx.clone(),
        };
        let slot = ActiveSlot(self.active.clone());
        let task = tokio::spawn(ctx.run(prepared, slot, received_at));

        RunHandle {
            run_name,
            run_dir,
            task,
        }
    }

    async fn reply(&self, text: &str) -> Result<(), SessionError> {
        self.status_tx
            .send(text.as_bytes().to_vec())
            .await
            .map_err(|_| SessionError::LinkClosed)
    }
}

/// Frees the session's run slot when dropped, including on unwind
struct ActiveSlot(Arc<Mutex<Option<ActiveRun>>>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        *lock(&self.0) = None;
    }
}

struct PreparedRun {
    config: RunConfig,
    writer: Arc<RawFrameWriter>,
    cancel_rx: broadcast::Receiver<()>,
}

/// What the spawned run task needs from the session
struct RunContext {
    settings: HostSettings,
    detector: SharedDetector,
    cache: Arc<BackgroundMedianCache>,
    transfer: Option<Arc<dyn TransferTrigger>>,
    status_tx: mpsc::Sender<Vec<u8>>,
}

impl RunContext {
    async fn run(
        self,
        prepared: PreparedRun,
        slot: ActiveSlot,
        received_at: Instant,
    ) -> Result<RunReport> {
        let result = self.acquire(prepared, received_at).await;
        drop(slot);

        let status = match &result {
            Ok(report) if report.is_complete() && report.all_expected_frames_received() => {
                let dir = tokio::fs::canonicalize(&report.run_dir)
                    .await
                    .unwrap_or_else(|_| report.run_dir.clone());
                StatusMessage::copy_dir(&dir)
            }
            Ok(report) => StatusMessage::message(match report.abort_reason() {
                Some(reason) => format!("Run {} aborted: {}", report.run_name, reason),
                None => format!(
                    "Run {} received {} of {} frames",
                    report.run_name, report.frames_received, report.frames_expected
                ),
            }),
            Err(e) => StatusMessage::message(format!("Run failed: {:#}", e)),
        };
        if self.status_tx.send(status.to_json().into_bytes()).await.is_err() {
            warn!("Controller link closed before run status could be sent");
        }

        if let (Some(transfer), StatusMessage::CopyDir { copy_dir }) = (&self.transfer, &status) {
            run_transfer(transfer.as_ref(), &PathBuf::from(copy_dir)).await;
        }

        result
    }

    async fn acquire(&self, prepared: PreparedRun, received_at: Instant) -> Result<RunReport> {
        let PreparedRun {
            config,
            writer,
            mut cancel_rx,
        } = prepared;
        let detector_settings = DetectorSettings::for_run(&config, self.settings.exposure_ms);

        let sequencer = AcquisitionSequencer::new(config, writer, self.cache.clone())
            .with_idle_timeout(self.settings.idle_timeout());

        let delay_elapsed = tokio::select! {
            _ = cancel_rx.recv() => false,
            _ = sleep_until(received_at + self.settings.arm_delay()) => true,
        };
        if !delay_elapsed {
            return sequencer.cancel();
        }

        let frames = {
            let mut detector = self.detector.lock().await;
            detector
                .apply(&detector_settings)
                .await
                .context("Failed to configure detector")?;
            detector
                .start_acquisition()
                .await
                .context("Failed to start detector")?
        };

        let report = sequencer.run(frames, cancel_rx).await;

        if let Err(e) = self.detector.lock().await.stop_acquisition().await {
            error!("Failed to stop detector: {:#}", e);
        }

        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
