use super::Image;

/// One triggered frame as reported by the detector driver
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    /// 1-based position in arrival order since the detector was started
    pub ordinal: u64,

    /// Raw pixel payload
    pub image: Image,
}

impl FrameEvent {
    pub fn new(ordinal: u64, image: Image) -> Self {
        Self { ordinal, image }
    }
}
