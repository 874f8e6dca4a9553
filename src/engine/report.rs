use super::classifier::UnexpectedFrame;
use super::state::AbortReason;
use crate::observability::RunMetricsSnapshot;
use std::fmt;
use std::path::PathBuf;

/// Non-fatal condition raised while a run was processed
#[derive(Debug, Clone, PartialEq)]
pub enum RunWarning {
    UnexpectedFrame(UnexpectedFrame),
    /// Data was collected but no median applies; raw data frames are kept
    NoBackgroundAvailable,
    /// Cached median belongs to another gain and was not applied
    GainMismatch { cached_gain: i64, run_gain: i64 },
    BackgroundRejected { ordinal: u64, error: String },
    MedianFailed(String),
    CachePersistFailed(String),
    SubtractionFailed { ordinal: u64, error: String },
    WriteFailed { file_name: String, error: String },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedFrame(e) => write!(f, "{}", e),
            Self::NoBackgroundAvailable => {
                write!(f, "No background median available, subtraction skipped")
            }
            Self::GainMismatch {
                cached_gain,
                run_gain,
            } => write!(
                f,
                "Cached background median was taken at gain {} but run uses gain {}, subtraction skipped",
                cached_gain, run_gain
            ),
            Self::BackgroundRejected { ordinal, error } => {
                write!(f, "Background frame {} excluded from median: {}", ordinal, error)
            }
            Self::MedianFailed(e) => write!(f, "Background median failed: {}", e),
            Self::CachePersistFailed(e) => write!(f, "Could not persist background median: {}", e),
            Self::SubtractionFailed { ordinal, error } => {
                write!(f, "Subtraction of frame {} failed: {}", ordinal, error)
            }
            Self::WriteFailed { file_name, error } => {
                write!(f, "Failed to write {}: {}", file_name, error)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Complete,
    Aborted(AbortReason),
}

/// Everything a finished (or aborted) run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_name: String,
    pub run_dir: PathBuf,
    pub outcome: RunOutcome,
    pub frames_expected: u64,
    pub frames_received: u64,
    /// Raw frames, including extras, in arrival order
    pub saved_frames: Vec<PathBuf>,
    pub median_file: Option<PathBuf>,
    pub subtracted_files: Vec<PathBuf>,
    pub warnings: Vec<RunWarning>,
    pub metrics: RunMetricsSnapshot,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Complete
    }

    pub fn all_expected_frames_received(&self) -> bool {
        self.frames_received >= self.frames_expected
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.outcome {
            RunOutcome::Aborted(reason) => Some(reason),
            RunOutcome::Complete => None,
        }
    }
}
