pub mod scp;

pub use scp::{TransferCommand, ScpTransfer};

use crate::config::TransferSettings;
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Result directory {0:?} has no final component")]
    InvalidDirectory(PathBuf),
}

/// Copies a finished run's directory to durable storage.
///
/// Failures are reported to the caller, never retried; the local files stay
/// the copy of record.
#[async_trait]
pub trait TransferTrigger: Send + Sync {
    /// Where results end up, for logging
    fn destination(&self) -> String;

    async fn on_run_complete(&self, result_dir: &Path) -> Result<(), TransferError>;
}

/// Used when transfers are disabled
pub struct NoTransfer;

#[async_trait]
impl TransferTrigger for NoTransfer {
    fn destination(&self) -> String {
        "nowhere (transfer disabled)".to_string()
    }

    async fn on_run_complete(&self, result_dir: &Path) -> Result<(), TransferError> {
        info!("Transfer disabled, leaving {} in place", result_dir.display());
        Ok(())
    }
}

pub fn from_settings(settings: &TransferSettings) -> Arc<dyn TransferTrigger> {
    if settings.enabled {
        Arc::new(ScpTransfer::new(settings.clone()))
    } else {
        Arc::new(NoTransfer)
    }
}

/// Run one transfer, downgrading failure to a warning
pub async fn run_transfer(trigger: &dyn TransferTrigger, result_dir: &Path) -> bool {
    info!(
        "Copying {} to {}",
        result_dir.display(),
        trigger.destination()
    );
    match trigger.on_run_complete(result_dir).await {
        Ok(()) => {
            info!("Transfer of {} finished", result_dir.display());
            true
        }
        Err(e) => {
            warn!("Transfer of {} failed: {}", result_dir.display(), e);
            false
        }
    }
}
