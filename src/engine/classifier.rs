use crate::core::RunConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a triggered frame within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameCategory {
    Skip,
    Background,
    Data,
    PostBackground,
}

impl FrameCategory {
    pub const ALL: [FrameCategory; 4] = [
        FrameCategory::Skip,
        FrameCategory::Background,
        FrameCategory::Data,
        FrameCategory::PostBackground,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Background => "background",
            Self::Data => "data",
            Self::PostBackground => "post_background",
        }
    }
}

/// Category plus the shot-frame tag (only ever set on the last data frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClass {
    pub category: FrameCategory,
    pub is_shot_frame: bool,
}

impl FrameClass {
    fn plain(category: FrameCategory) -> Self {
        Self {
            category,
            is_shot_frame: false,
        }
    }
}

/// A trigger arrived outside `1..=expected_total`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Unexpected frame {ordinal}: run expects {expected_total} frames")]
pub struct UnexpectedFrame {
    pub ordinal: u64,
    pub expected_total: u64,
}

/// Cumulative upper bounds of each category range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBoundaries {
    pub skip_end: u64,
    pub background_end: u64,
    pub data_end: u64,
    pub post_background_end: u64,
}

impl FrameBoundaries {
    pub fn from_config(config: &RunConfig) -> Self {
        let skip_end = config.num_skip;
        // validate() rejects totals that overflow; saturate for hand-built configs
        let background_end = skip_end.saturating_add(config.num_background);
        let data_end = background_end.saturating_add(config.num_data);
        let post_background_end = data_end.saturating_add(config.num_post_background);
        Self {
            skip_end,
            background_end,
            data_end,
            post_background_end,
        }
    }

    pub fn total(&self) -> u64 {
        self.post_background_end
    }
}

/// Maps trigger ordinals to frame categories for one run configuration
#[derive(Debug, Clone, Copy)]
pub struct FrameClassifier {
    boundaries: FrameBoundaries,
    includes_shot_frame: bool,
}

impl FrameClassifier {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            boundaries: FrameBoundaries::from_config(config),
            includes_shot_frame: config.includes_shot_frame,
        }
    }

    pub fn boundaries(&self) -> FrameBoundaries {
        self.boundaries
    }

    pub fn expected_total(&self) -> u64 {
        self.boundaries.total()
    }

    /// Ordinals are 1-based; 0 is never a valid trigger and is reported as unexpected
    pub fn classify(&self, ordinal: u64) -> Result<FrameClass, UnexpectedFrame> {
        let b = &self.boundaries;
        let unexpected = UnexpectedFrame {
            ordinal,
            expected_total: b.total(),
        };

        if ordinal == 0 {
            return Err(unexpected);
        }

        let class = if ordinal <= b.skip_end {
            FrameClass::plain(FrameCategory::Skip)
        } else if ordinal <= b.background_end {
            FrameClass::plain(FrameCategory::Background)
        } else if ordinal <= b.data_end {
            FrameClass {
                category: FrameCategory::Data,
                is_shot_frame: self.includes_shot_frame && ordinal == b.data_end,
            }
        } else if ordinal <= b.post_background_end {
            FrameClass::plain(FrameCategory::PostBackground)
        } else {
            return Err(unexpected);
        };

        Ok(class)
    }
}

/// One-shot form of [`FrameClassifier::classify`]
pub fn classify(ordinal: u64, config: &RunConfig) -> Result<FrameClass, UnexpectedFrame> {
    FrameClassifier::new(config).classify(ordinal)
}
