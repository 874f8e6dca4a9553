pub mod naming;
pub mod writer;

pub use naming::{frame_file_name, median_file_name, Product, ARM_CONFIG_FILE_NAME};
pub use writer::{FrameWriter, RawFrameWriter};
