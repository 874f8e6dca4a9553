pub mod frame;
pub mod image;
pub mod run_config;

pub use frame::FrameEvent;
pub use image::{Image, ImageError};
pub use run_config::{ArmCommand, ArmCommandError, RunConfig, RunName, ARM_COMMAND};
