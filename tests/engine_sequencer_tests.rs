use panel_daq::background::{BackgroundMedianCache, CacheLookup};
use panel_daq::core::{FrameEvent, Image, RunConfig};
use panel_daq::engine::{AbortReason, AcquisitionSequencer, RunOutcome, RunReport, RunWarning};
use panel_daq::storage::RawFrameWriter;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration, Instant};

struct Fixture {
    dir: TempDir,
    cache: Arc<BackgroundMedianCache>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BackgroundMedianCache::new(dir.path().join("cache/median.bin")));
        Self { dir, cache }
    }

    fn run_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("Runs/exp/7")
    }

    fn sequencer(&self, config: RunConfig) -> AcquisitionSequencer {
        let writer = Arc::new(RawFrameWriter::new(self.run_dir()).unwrap());
        AcquisitionSequencer::new(config, writer, self.cache.clone())
    }

    fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.run_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn config(skip: u64, background: u64, data: u64, post: u64, gain: i64) -> RunConfig {
    RunConfig {
        experiment: "exp".to_string(),
        run_name: "7".to_string(),
        num_skip: skip,
        num_background: background,
        num_data: data,
        num_post_background: post,
        includes_shot_frame: true,
        gain,
        binning: 1,
        save_files_path: None,
    }
}

fn flat(value: f32) -> Image {
    Image::new(2, 2, vec![value; 4]).unwrap()
}

fn read_image(path: &Path) -> Image {
    Image::from_le_bytes(2, 2, &std::fs::read(path).unwrap()).unwrap()
}

/// Queue `images` as frames 1..; the sender is returned so the source stays open
fn frames(images: Vec<Image>) -> (mpsc::Sender<FrameEvent>, mpsc::Receiver<FrameEvent>) {
    let (tx, rx) = mpsc::channel(64);
    for (i, image) in images.into_iter().enumerate() {
        tx.try_send(FrameEvent::new(i as u64 + 1, image)).unwrap();
    }
    (tx, rx)
}

async fn run(
    sequencer: AcquisitionSequencer,
    rx: mpsc::Receiver<FrameEvent>,
) -> (RunReport, broadcast::Sender<()>) {
    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    let report = sequencer.run(rx, cancel_rx).await.unwrap();
    (report, cancel_tx)
}

#[tokio::test]
async fn test_five_frame_run_with_shot_frame() {
    let fx = Fixture::new();
    let (_tx, rx) = frames(vec![
        flat(0.0),
        flat(1.0),
        flat(10.0),
        flat(20.0),
        Image::new(2, 2, vec![100.0, 110.0, 120.0, 130.0]).unwrap(),
    ]);

    let (report, _) = run(fx.sequencer(config(2, 2, 1, 0, 4)), rx).await;

    assert_eq!(report.outcome, RunOutcome::Complete);
    assert_eq!(report.frames_received, 5);
    assert!(report.warnings.is_empty());
    assert_eq!(report.saved_frames.len(), 5);
    assert_eq!(report.subtracted_files.len(), 1);

    assert_eq!(
        fx.files(),
        vec![
            "7_0001_skip.raw",
            "7_0002_skip.raw",
            "7_0003_background.raw",
            "7_0004_background.raw",
            "7_0005_data_ds.raw",
            "7_0005_data_shot.raw",
            "7_background_median.raw",
        ]
    );

    let median = read_image(report.median_file.as_deref().unwrap());
    assert_eq!(median, flat(15.0));
    let subtracted = read_image(&report.subtracted_files[0]);
    assert_eq!(subtracted.pixels(), &[85.0, 95.0, 105.0, 115.0]);

    assert_eq!(report.metrics.skip, 2);
    assert_eq!(report.metrics.background, 2);
    assert_eq!(report.metrics.data, 1);
    assert_eq!(report.metrics.files_written, 7);
}

#[tokio::test]
async fn test_background_median_is_persisted() {
    let fx = Fixture::new();
    let (_tx, rx) = frames(vec![flat(0.0), flat(3.0), flat(5.0), flat(4.0)]);

    let (report, _) = run(fx.sequencer(config(1, 3, 0, 0, 8)), rx).await;

    assert!(report.is_complete());
    assert!(report.subtracted_files.is_empty());
    assert_eq!(fx.cache.lookup(8).unwrap(), CacheLookup::Hit(flat(4.0)));
}

#[tokio::test]
async fn test_cached_median_applies_at_same_gain() {
    let fx = Fixture::new();
    fx.cache.persist(&flat(30.0), 4).unwrap();
    let (_tx, rx) = frames(vec![flat(0.0), flat(50.0), flat(60.0)]);

    let (report, _) = run(fx.sequencer(config(1, 0, 2, 0, 4)), rx).await;

    assert!(report.warnings.is_empty());
    assert!(report.median_file.is_none());
    assert_eq!(report.subtracted_files.len(), 2);
    assert_eq!(read_image(&report.subtracted_files[0]), flat(20.0));
    assert_eq!(read_image(&report.subtracted_files[1]), flat(30.0));
}

#[tokio::test]
async fn test_wrong_gain_cache_is_never_applied() {
    let fx = Fixture::new();
    fx.cache.persist(&flat(30.0), 8).unwrap();
    let (_tx, rx) = frames(vec![flat(0.0), flat(50.0)]);

    let (report, _) = run(fx.sequencer(config(1, 0, 1, 0, 4)), rx).await;

    assert!(report.is_complete());
    assert!(report.subtracted_files.is_empty());
    assert_eq!(
        report.warnings,
        vec![RunWarning::GainMismatch {
            cached_gain: 8,
            run_gain: 4
        }]
    );
    // raw data frame is still on disk
    assert!(fx.files().contains(&"7_0002_data_shot.raw".to_string()));
}

#[tokio::test]
async fn test_no_background_available() {
    let fx = Fixture::new();
    let (_tx, rx) = frames(vec![flat(0.0), flat(50.0)]);

    let (report, _) = run(fx.sequencer(config(1, 0, 1, 0, 4)), rx).await;

    assert!(report.is_complete());
    assert_eq!(report.warnings, vec![RunWarning::NoBackgroundAvailable]);
    assert_eq!(fx.files(), vec!["7_0001_skip.raw", "7_0002_data_shot.raw"]);
}

#[tokio::test]
async fn test_extra_triggers_are_saved() {
    let fx = Fixture::new();
    let (_tx, rx) = frames(vec![flat(0.0), flat(1.0), flat(2.0), flat(3.0)]);

    let (report, _) = run(fx.sequencer(config(1, 1, 0, 0, 4)), rx).await;

    assert!(report.is_complete());
    assert_eq!(report.frames_received, 4);
    assert!(report.all_expected_frames_received());
    assert_eq!(report.metrics.extra, 2);
    let unexpected = report
        .warnings
        .iter()
        .filter(|w| matches!(w, RunWarning::UnexpectedFrame(_)))
        .count();
    assert_eq!(unexpected, 2);
    assert!(fx.files().contains(&"7_0003_extra.raw".to_string()));
    assert!(fx.files().contains(&"7_0004_extra.raw".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_aborts_with_no_files() {
    let fx = Fixture::new();
    let (_tx, rx) = frames(vec![]);
    let started = Instant::now();

    let (report, _) = run(fx.sequencer(config(2, 2, 1, 0, 4)), rx).await;

    assert_eq!(report.abort_reason(), Some(&AbortReason::NoTriggerTimeout));
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert!(report.saved_frames.is_empty());
    assert!(fx.files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_first_frame_just_inside_timeout() {
    let fx = Fixture::new();
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        sleep(Duration::from_millis(14_900)).await;
        for ordinal in 1..=2 {
            tx.send(FrameEvent::new(ordinal, flat(1.0))).await.unwrap();
        }
        // later frames are not time-guarded
        sleep(Duration::from_secs(120)).await;
        tx.send(FrameEvent::new(3, flat(9.0))).await.unwrap();
        tx
    });

    let (report, _) = run(fx.sequencer(config(1, 1, 1, 0, 4)), rx).await;

    assert!(report.is_complete());
    assert_eq!(report.frames_received, 3);
}

#[tokio::test]
async fn test_cancel_skips_finalizing() {
    let fx = Fixture::new();
    let (tx, rx) = mpsc::channel(8);
    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    let sequencer = fx.sequencer(config(1, 2, 1, 0, 4));

    let running = tokio::spawn(sequencer.run(rx, cancel_rx));
    for ordinal in 1..=3 {
        tx.send(FrameEvent::new(ordinal, flat(ordinal as f32))).await.unwrap();
    }
    // let the three frames be consumed before cancelling
    for _ in 0..200 {
        if fx.files().len() == 3 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    cancel_tx.send(()).unwrap();

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.abort_reason(), Some(&AbortReason::Cancelled));
    assert!(report.median_file.is_none());
    assert_eq!(fx.cache.lookup(4).unwrap(), CacheLookup::Missing);
    assert_eq!(fx.files().len(), 3);
}

#[tokio::test]
async fn test_source_closing_early_aborts() {
    let fx = Fixture::new();
    let (tx, rx) = frames(vec![flat(0.0), flat(1.0)]);
    drop(tx);

    let (report, _) = run(fx.sequencer(config(1, 2, 2, 0, 4)), rx).await;

    assert_eq!(
        report.abort_reason(),
        Some(&AbortReason::FrameSourceClosed {
            received: 2,
            expected: 5
        })
    );
    assert!(report.median_file.is_none());
    assert_eq!(fx.files().len(), 2);
}
