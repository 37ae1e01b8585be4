//! Decoded pixel samples.
use snafu::{ensure, Backtrace, Snafu};

use crate::layout::PixelLayout;

#[derive(Debug, Snafu)]
#[snafu(display(
    "{} samples do not fit {} frames of {} planes with {} pixels",
    actual,
    frames,
    planes,
    pixels
))]
pub struct ShapeError {
    frames: u32,
    planes: u16,
    pixels: u32,
    actual: usize,
    backtrace: Backtrace,
}

/// A grid of decoded integer samples, indexed by frame, sample plane and pixel.
///
/// The shape is fixed at construction.
/// Samples are stored frame by frame, plane by plane,
/// whatever the planar configuration of the encoded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelSampleBuffer {
    frames: u32,
    planes: u16,
    pixels: u32,
    samples: Vec<i32>,
    overlay: Option<Vec<u16>>,
}

impl PixelSampleBuffer {
    /// A buffer of zeros shaped after the given layout.
    pub fn zeros(layout: &PixelLayout) -> Self {
        let len = layout.total_samples() as usize;
        PixelSampleBuffer {
            frames: layout.number_of_frames(),
            planes: layout.samples_per_pixel(),
            pixels: layout.pixels_per_frame(),
            samples: vec![0; len],
            overlay: None,
        }
    }

    /// Wrap samples already in frame, plane, pixel order.
    pub fn from_samples(
        frames: u32,
        planes: u16,
        pixels: u32,
        samples: Vec<i32>,
    ) -> Result<Self, ShapeError> {
        let expected = u64::from(frames) * u64::from(planes) * u64::from(pixels);
        ensure!(
            samples.len() as u64 == expected,
            ShapeSnafu {
                frames,
                planes,
                pixels,
                actual: samples.len(),
            }
        );
        Ok(PixelSampleBuffer {
            frames,
            planes,
            pixels,
            samples,
            overlay: None,
        })
    }

    pub(crate) fn with_overlay(mut self) -> Self {
        self.overlay = Some(vec![0; self.samples.len()]);
        self
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn planes(&self) -> u16 {
        self.planes
    }

    /// Number of pixels in each plane.
    pub fn pixels(&self) -> u32 {
        self.pixels
    }

    fn index(&self, frame: u32, plane: u16, pixel: u32) -> Option<usize> {
        if frame >= self.frames || plane >= self.planes || pixel >= self.pixels {
            return None;
        }
        let i = (u64::from(frame) * u64::from(self.planes) + u64::from(plane))
            * u64::from(self.pixels)
            + u64::from(pixel);
        Some(i as usize)
    }

    pub fn get(&self, frame: u32, plane: u16, pixel: u32) -> Option<i32> {
        self.index(frame, plane, pixel).map(|i| self.samples[i])
    }

    /// Set one sample, returning whether it was within bounds.
    pub fn set(&mut self, frame: u32, plane: u16, pixel: u32, value: i32) -> bool {
        match self.index(frame, plane, pixel) {
            Some(i) => {
                self.samples[i] = value;
                true
            }
            None => false,
        }
    }

    /// The overlay bits found next to a sample, if they were grabbed.
    pub fn overlay(&self, frame: u32, plane: u16, pixel: u32) -> Option<u16> {
        let i = self.index(frame, plane, pixel)?;
        self.overlay.as_ref().map(|overlay| overlay[i])
    }

    pub(crate) fn set_overlay(&mut self, frame: u32, plane: u16, pixel: u32, bits: u16) {
        if let (Some(i), Some(overlay)) = (self.index(frame, plane, pixel), self.overlay.as_mut())
        {
            overlay[i] = bits;
        }
    }

    /// All samples of one plane of one frame.
    pub fn plane(&self, frame: u32, plane: u16) -> Option<&[i32]> {
        let start = self.index(frame, plane, 0)?;
        Some(&self.samples[start..start + self.pixels as usize])
    }

    /// All samples, frame by frame and plane by plane.
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i32> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_indexed_by_frame_plane_pixel() {
        let samples = (0..24).collect::<Vec<i32>>();
        let mut buffer = PixelSampleBuffer::from_samples(2, 3, 4, samples).unwrap();
        assert_eq!(buffer.get(0, 0, 0), Some(0));
        assert_eq!(buffer.get(0, 1, 2), Some(6));
        assert_eq!(buffer.get(1, 2, 3), Some(23));
        assert_eq!(buffer.get(2, 0, 0), None);
        assert_eq!(buffer.get(0, 3, 0), None);
        assert_eq!(buffer.plane(1, 0), Some(&[12, 13, 14, 15][..]));

        assert!(buffer.set(1, 0, 1, -7));
        assert!(!buffer.set(0, 0, 4, 1));
        assert_eq!(buffer.get(1, 0, 1), Some(-7));
        assert_eq!(buffer.overlay(1, 0, 1), None);
    }

    #[test]
    fn shape_must_match_the_samples() {
        assert!(PixelSampleBuffer::from_samples(2, 1, 4, vec![0; 7]).is_err());
    }
}
