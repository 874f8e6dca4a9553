use crate::core::Image;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Destination for saved frames and derived products
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// Persist `image` under `file_name`, returning where it landed
    async fn write(&self, file_name: &str, image: &Image) -> Result<PathBuf>;

    fn directory(&self) -> &Path;
}

/// Writes headerless little-endian f32 pixels into one run directory
pub struct RawFrameWriter {
    dir: PathBuf,
}

impl RawFrameWriter {
    /// Creates the directory if it doesn't exist
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory {:?}", dir))?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl FrameWriter for RawFrameWriter {
    async fn write(&self, file_name: &str, image: &Image) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, image.to_le_bytes())
            .await
            .with_context(|| format!("Failed to write frame to {:?}", path))?;
        Ok(path)
    }

    fn directory(&self) -> &Path {
        &self.dir
    }
}
