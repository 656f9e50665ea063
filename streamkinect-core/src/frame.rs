//! Depth frame type.

/// One depth image in row-major order.
///
/// Samples are 12-bit depth values stored in `u16`. Frames are handed to
/// listeners by reference and must not be retained past the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthFrame {
    pub width: u16,
    pub height: u16,
    pub samples: Vec<u16>,
}

impl DepthFrame {
    pub fn new(width: u16, height: u16, samples: Vec<u16>) -> Self {
        debug_assert_eq!(samples.len(), width as usize * height as usize);
        Self {
            width,
            height,
            samples,
        }
    }

    /// Returns the number of samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Returns the sample at column `x`, row `y`.
    pub fn sample(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}
