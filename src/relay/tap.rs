use crate::protocol::StatusMessage;
use crate::transfer::{run_transfer, TransferTrigger};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the queue between the relay and the transfer task
pub const TAP_CAPACITY: usize = 32;

/// Watch detector-host status traffic and copy every announced run directory.
///
/// Transfers run one after another on this task, away from the forwarding
/// loops. The task ends when the relay drops its end of the tap.
pub fn spawn_transfer_tap(
    mut tapped: mpsc::Receiver<Vec<u8>>,
    trigger: Arc<dyn TransferTrigger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = tapped.recv().await {
            match StatusMessage::parse(&bytes) {
                Some(StatusMessage::CopyDir { copy_dir }) => {
                    run_transfer(trigger.as_ref(), &PathBuf::from(copy_dir)).await;
                }
                Some(other) => debug!("Status from detector host: {:?}", other),
                None => debug!(
                    "Detector host said: {}",
                    String::from_utf8_lossy(&bytes).trim()
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl TransferTrigger for Recorder {
        fn destination(&self) -> String {
            "recorder".to_string()
        }

        async fn on_run_complete(&self, result_dir: &Path) -> Result<(), TransferError> {
            self.dirs.lock().unwrap().push(result_dir.to_path_buf());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_only_copy_dir_triggers_transfer() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        let handle = spawn_transfer_tap(rx, recorder.clone());

        tx.send(b"OK".to_vec()).await.unwrap();
        tx.send(br#"{"message":"aborted"}"#.to_vec()).await.unwrap();
        tx.send(br#"{"copy_dir":"/Runs/exp/7"}"#.to_vec()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            *recorder.dirs.lock().unwrap(),
            vec![PathBuf::from("/Runs/exp/7")]
        );
    }
}
