use super::BackgroundError;
use crate::core::Image;

/// Background frames collected during one run
#[derive(Debug, Default)]
pub struct BackgroundAccumulator {
    frames: Vec<Image>,
}

impl BackgroundAccumulator {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Append a frame; every frame must share the first frame's geometry
    pub fn add(&mut self, frame: Image) -> Result<(), BackgroundError> {
        if let Some(first) = self.frames.first() {
            first.check_geometry(&frame)?;
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn compute_median(&self) -> Result<Image, BackgroundError> {
        median_of(&self.frames)
    }
}

/// Pixel-wise median over a stack of equally sized frames.
///
/// For an even stack the two middle values are averaged. The result does not
/// depend on the order of `frames`.
pub fn median_of(frames: &[Image]) -> Result<Image, BackgroundError> {
    let first = frames.first().ok_or(BackgroundError::EmptyBackgroundSet)?;
    for frame in &frames[1..] {
        first.check_geometry(frame)?;
    }

    let n = frames.len();
    let mut stack = vec![0.0f32; n];
    let mut out = Vec::with_capacity(first.pixels().len());

    for px in 0..first.pixels().len() {
        for (slot, frame) in stack.iter_mut().zip(frames) {
            *slot = frame.pixels()[px];
        }
        stack.sort_unstable_by(|a, b| a.total_cmp(b));
        let median = if n % 2 == 1 {
            stack[n / 2]
        } else {
            (stack[n / 2 - 1] + stack[n / 2]) / 2.0
        };
        out.push(median);
    }

    Ok(Image::new(first.rows(), first.columns(), out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(values: &[f32]) -> Image {
        Image::new(1, values.len(), values.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_set_fails() {
        let acc = BackgroundAccumulator::new();
        assert!(matches!(
            acc.compute_median(),
            Err(BackgroundError::EmptyBackgroundSet)
        ));
    }

    #[test]
    fn test_odd_stack_median() {
        let mut acc = BackgroundAccumulator::new();
        acc.add(img(&[1.0, 9.0, 5.0])).unwrap();
        acc.add(img(&[3.0, 7.0, 5.0])).unwrap();
        acc.add(img(&[2.0, 8.0, 100.0])).unwrap();

        let median = acc.compute_median().unwrap();
        assert_eq!(median.pixels(), &[2.0, 8.0, 5.0]);
    }

    #[test]
    fn test_even_stack_averages_middle_pair() {
        let frames = vec![img(&[1.0, 10.0]), img(&[3.0, 20.0])];
        let median = median_of(&frames).unwrap();
        assert_eq!(median.pixels(), &[2.0, 15.0]);
    }

    #[test]
    fn test_order_independent() {
        let frames = vec![
            img(&[4.0, 1.0, 0.5]),
            img(&[2.0, 3.0, 7.5]),
            img(&[9.0, 2.0, 1.5]),
            img(&[1.0, 8.0, 3.0]),
        ];
        let expected = median_of(&frames).unwrap();

        let orders = [[3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders {
            let shuffled: Vec<Image> = order.iter().map(|&i| frames[i].clone()).collect();
            assert_eq!(median_of(&shuffled).unwrap(), expected);
        }

        // idempotent
        assert_eq!(median_of(&frames).unwrap(), expected);
    }

    #[test]
    fn test_add_rejects_mismatched_geometry() {
        let mut acc = BackgroundAccumulator::new();
        acc.add(Image::zeros(2, 2)).unwrap();

        let result = acc.add(Image::zeros(2, 3));
        assert!(matches!(result, Err(BackgroundError::DimensionMismatch(_))));
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_median_of_rejects_mismatched_stack() {
        let frames = vec![Image::zeros(2, 2), Image::zeros(4, 1)];
        assert!(matches!(
            median_of(&frames),
            Err(BackgroundError::DimensionMismatch(_))
        ));
    }
}
