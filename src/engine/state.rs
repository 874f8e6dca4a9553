use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Why a run stopped before finalizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum AbortReason {
    #[error("No trigger received within the idle timeout after arming")]
    NoTriggerTimeout,

    #[error("Run cancelled by operator")]
    Cancelled,

    #[error("Frame source closed after {received} of {expected} frames")]
    FrameSourceClosed { received: u64, expected: u64 },
}

/// Acquisition run states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Armed {
        #[serde(skip)]
        armed_at: Option<Instant>,
    },
    Collecting {
        frames_received: u64,
    },
    Finalizing,
    Complete {
        total_frames: u64,
    },
    Aborted {
        reason: AbortReason,
    },
}

impl RunPhase {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &RunPhase) -> bool {
        use RunPhase::*;

        matches!(
            (self, target),
            (Armed { .. }, Collecting { .. }) |
            (Armed { .. }, Aborted { .. }) |

            // frame counter updates stay in Collecting
            (Collecting { .. }, Collecting { .. }) |
            (Collecting { .. }, Finalizing) |
            (Collecting { .. }, Aborted { .. }) |

            (Finalizing, Complete { .. })
        )
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Armed { .. } => "Armed",
            Self::Collecting { .. } => "Collecting",
            Self::Finalizing => "Finalizing",
            Self::Complete { .. } => "Complete",
            Self::Aborted { .. } => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Aborted { .. })
    }
}
