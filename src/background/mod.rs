pub mod accumulator;
pub mod cache;

pub use accumulator::{median_of, BackgroundAccumulator};
pub use cache::{BackgroundMedianCache, CacheLookup, CachedMedian};

use crate::core::ImageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("No background frames were collected")]
    EmptyBackgroundSet,

    #[error(transparent)]
    DimensionMismatch(#[from] ImageError),

    #[error("Background cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background cache file is corrupt: {0}")]
    Corrupt(String),
}
