use crate::engine::{FrameCategory, FrameClass};

pub const RAW_EXTENSION: &str = "raw";

/// Copy of the accepted arm command kept in every run directory
pub const ARM_CONFIG_FILE_NAME: &str = "arm_config.json";

/// Every kind of file a run can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Raw(FrameClass),
    /// Trigger received after the expected total
    Extra,
    /// Data frame minus the background median
    Subtracted,
    BackgroundMedian,
}

impl Product {
    pub fn suffix(&self) -> &'static str {
        match self {
            Product::Raw(class) => match class.category {
                FrameCategory::Skip => "skip",
                FrameCategory::Background => "background",
                FrameCategory::Data if class.is_shot_frame => "data_shot",
                FrameCategory::Data => "data",
                FrameCategory::PostBackground => "post_background",
            },
            Product::Extra => "extra",
            Product::Subtracted => "data_ds",
            Product::BackgroundMedian => "background_median",
        }
    }
}

/// `<run>_<ordinal:04>_<suffix>.raw`
pub fn frame_file_name(run_name: &str, ordinal: u64, product: Product) -> String {
    format!("{}_{:04}_{}.{}", run_name, ordinal, product.suffix(), RAW_EXTENSION)
}

/// `<run>_background_median.raw`, one per run
pub fn median_file_name(run_name: &str) -> String {
    format!(
        "{}_{}.{}",
        run_name,
        Product::BackgroundMedian.suffix(),
        RAW_EXTENSION
    )
}
