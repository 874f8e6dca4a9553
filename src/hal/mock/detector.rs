use crate::core::{FrameEvent, Image};
use crate::hal::frame_ring::{FrameRing, DEFAULT_RING_FRAMES};
use crate::hal::{Detector, DetectorSettings, DetectorState, FrameGeometry, TriggerMode};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Pixel value for `(ordinal, pixel_index)`
pub type PixelFn = Arc<dyn Fn(u64, usize) -> u16 + Send + Sync>;

const TRIGGER_QUEUE: usize = 256;
const FRAME_QUEUE: usize = 64;

/// Free-run rate of the panel in idle mode (~15 Hz)
pub const FREE_RUN_INTERVAL: Duration = Duration::from_millis(66);

type SharedTrigger = Arc<Mutex<Option<mpsc::Sender<()>>>>;

/// Stand-in for the external trigger line
#[derive(Clone)]
pub struct TriggerHandle {
    tx: SharedTrigger,
}

impl TriggerHandle {
    /// Fire one trigger pulse; ignored unless an externally triggered acquisition is running
    pub fn fire(&self) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }
}

/// Software detector producing one frame per trigger (or per tick when free-running)
pub struct SimulatedDetector {
    id: String,
    geometry: FrameGeometry,
    ring_frames: usize,
    settings: DetectorSettings,
    free_run_interval: Duration,
    state: DetectorState,
    pixels: PixelFn,
    trigger_tx: SharedTrigger,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedDetector {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            id: "simulated-0".to_string(),
            geometry,
            ring_frames: DEFAULT_RING_FRAMES,
            settings: DetectorSettings::default(),
            free_run_interval: FREE_RUN_INTERVAL,
            state: DetectorState::Ready,
            pixels: Arc::new(|ordinal, idx| 100 + ((ordinal as usize * 31 + idx) % 50) as u16),
            trigger_tx: Arc::new(Mutex::new(None)),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn with_pixels(mut self, pixels: PixelFn) -> Self {
        self.pixels = pixels;
        self
    }

    pub fn with_ring_frames(mut self, ring_frames: usize) -> Self {
        self.ring_frames = ring_frames;
        self
    }

    pub fn with_free_run_interval(mut self, interval: Duration) -> Self {
        self.free_run_interval = interval;
        self
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    fn set_trigger(&self, tx: Option<mpsc::Sender<()>>) {
        *self.trigger_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = tx;
    }
}

#[async_trait]
impl Detector for SimulatedDetector {
    fn detector_id(&self) -> &str {
        &self.id
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    async fn apply(&mut self, settings: &DetectorSettings) -> Result<()> {
        if self.state == DetectorState::Acquiring {
            return Err(anyhow!("Cannot change settings while acquiring"));
        }
        debug!("{}: applying {:?}", self.id, settings);
        self.settings = *settings;
        Ok(())
    }

    async fn start_acquisition(&mut self) -> Result<mpsc::Receiver<FrameEvent>> {
        if self.state == DetectorState::Acquiring {
            return Err(anyhow!("Acquisition already running on {}", self.id));
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let (trig_tx, mut trig_rx) = mpsc::channel::<()>(TRIGGER_QUEUE);

        let mode = self.settings.trigger_mode;
        if mode == TriggerMode::External {
            self.set_trigger(Some(trig_tx));
        }

        let geometry = self.geometry;
        let mut ring = FrameRing::new(geometry, self.ring_frames);
        let pixels = self.pixels.clone();
        let interval = self.free_run_interval;
        let id = self.id.clone();

        let task = tokio::spawn(async move {
            let mut ordinal = 0u64;
            loop {
                let fired = match mode {
                    TriggerMode::External => tokio::select! {
                        _ = shutdown_rx.recv() => false,
                        pulse = trig_rx.recv() => pulse.is_some(),
                    },
                    TriggerMode::Internal => tokio::select! {
                        _ = shutdown_rx.recv() => false,
                        _ = sleep(interval) => true,
                    },
                };
                if !fired {
                    break;
                }

                ordinal += 1;
                for (idx, px) in ring.current_slot_mut().iter_mut().enumerate() {
                    *px = pixels(ordinal, idx);
                }
                let image = match Image::from_u16(geometry.rows, geometry.columns, ring.current_slot()) {
                    Ok(image) => image,
                    Err(e) => {
                        error!("{}: bad frame in ring slot {}: {}", id, ring.current_index(), e);
                        break;
                    }
                };
                ring.advance();

                if frame_tx.send(FrameEvent::new(ordinal, image)).await.is_err() {
                    break;
                }
            }
            debug!("{}: acquisition loop exited after {} frames", id, ordinal);
        });

        info!("{}: acquisition started ({:?} trigger)", self.id, mode);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        self.state = DetectorState::Acquiring;
        Ok(frame_rx)
    }

    async fn stop_acquisition(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.set_trigger(None);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| anyhow!("Acquisition task failed: {}", e))?;
        }
        if self.state == DetectorState::Acquiring {
            info!("{}: acquisition stopped", self.id);
            self.state = DetectorState::Stopped;
        }
        Ok(())
    }

    fn state(&self) -> DetectorState {
        self.state.clone()
    }
}

impl Drop for SimulatedDetector {
    fn drop(&mut self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(());
        }
    }
}
