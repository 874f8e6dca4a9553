pub mod classifier;
pub mod report;
pub mod sequencer;
pub mod state;

pub use classifier::{
    classify, FrameBoundaries, FrameCategory, FrameClass, FrameClassifier, UnexpectedFrame,
};
pub use report::{RunOutcome, RunReport, RunWarning};
pub use sequencer::{AcquisitionSequencer, IDLE_TIMEOUT};
pub use state::{AbortReason, RunPhase};
