use super::types::FrameGeometry;

/// Default number of destination slots handed to the driver
pub const DEFAULT_RING_FRAMES: usize = 50;

/// Fixed set of frame slots the driver writes into round-robin.
///
/// The slot at `current_index()` is the one the next frame lands in; after a
/// frame has been copied out the ring is advanced, wrapping to slot 0.
pub struct FrameRing {
    geometry: FrameGeometry,
    slots: Vec<Vec<u16>>,
    current: usize,
}

impl FrameRing {
    pub fn new(geometry: FrameGeometry, num_slots: usize) -> Self {
        let num_slots = num_slots.max(1);
        Self {
            geometry,
            slots: vec![vec![0u16; geometry.pixels()]; num_slots],
            current: 0,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.geometry.pixels() * std::mem::size_of::<u16>()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_slot(&self) -> &[u16] {
        &self.slots[self.current]
    }

    pub fn current_slot_mut(&mut self) -> &mut [u16] {
        &mut self.slots[self.current]
    }

    pub fn advance(&mut self) {
        self.current += 1;
        if self.current == self.slots.len() {
            self.current = 0;
        }
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FrameGeometry {
        FrameGeometry { rows: 4, columns: 3 }
    }

    #[test]
    fn test_ring_shape() {
        let ring = FrameRing::new(geometry(), DEFAULT_RING_FRAMES);
        assert_eq!(ring.num_slots(), 50);
        assert_eq!(ring.current_slot().len(), 12);
        assert_eq!(ring.bytes_per_frame(), 24);
    }

    #[test]
    fn test_advance_wraps() {
        let mut ring = FrameRing::new(geometry(), 3);
        ring.advance();
        ring.advance();
        assert_eq!(ring.current_index(), 2);
        ring.advance();
        assert_eq!(ring.current_index(), 0);
    }

    #[test]
    fn test_slots_are_independent() {
        let mut ring = FrameRing::new(geometry(), 2);
        ring.current_slot_mut()[0] = 7;
        ring.advance();
        assert_eq!(ring.current_slot()[0], 0);
        ring.advance();
        assert_eq!(ring.current_slot()[0], 7);
    }

    #[test]
    fn test_zero_slots_clamped() {
        let ring = FrameRing::new(geometry(), 0);
        assert_eq!(ring.num_slots(), 1);
    }
}
