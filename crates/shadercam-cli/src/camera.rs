use std::time::Duration;

use camconfig::{CameraPattern, CameraSection};
use shadercam::CameraImage;

/// Deterministic stand-in for a camera: animated RGBA test patterns on a fixed clock.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    interval: Duration,
    pattern: CameraPattern,
}

impl SyntheticCamera {
    pub fn new(section: &CameraSection) -> Self {
        Self {
            width: section.width,
            height: section.height,
            interval: section.frame_interval,
            pattern: section.pattern,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Image number `index`, stamped `index * interval` after the first.
    pub fn frame(&self, index: u32) -> CameraImage {
        let timestamp = self.interval.as_nanos() * u128::from(index);
        let timestamp_ns = i64::try_from(timestamp).unwrap_or(i64::MAX);
        CameraImage::new(self.width, self.height, self.pixels(index), timestamp_ns)
    }

    fn pixels(&self, index: u32) -> Vec<u8> {
        let (width, height) = (self.width, self.height);
        let phase = (index % 256) as u8;
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let rgba = match self.pattern {
                    CameraPattern::Gradient => [
                        (x * 255 / width.max(1)) as u8,
                        (y * 255 / height.max(1)) as u8,
                        phase,
                        255,
                    ],
                    CameraPattern::Checker => {
                        let cell = ((x / 32) + (y / 32) + index / 15) % 2 == 0;
                        if cell {
                            [235, 235, 235, 255]
                        } else {
                            [20, 20, 20, 255]
                        }
                    }
                    CameraPattern::Solid => [phase, 128, 255 - phase, 255],
                };
                pixels.extend_from_slice(&rgba);
            }
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(pattern: CameraPattern) -> SyntheticCamera {
        SyntheticCamera::new(&CameraSection {
            width: 4,
            height: 2,
            pattern,
            ..CameraSection::default()
        })
    }

    #[test]
    fn frames_are_stamped_on_the_interval() {
        let camera = camera(CameraPattern::Solid);
        let frame = camera.frame(3);
        assert_eq!(frame.timestamp_ns, 99_000_000);
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.pixels.len(), 4 * 2 * 4);
    }

    #[test]
    fn gradient_varies_across_the_image() {
        let frame = camera(CameraPattern::Gradient).frame(0);
        assert_eq!(frame.pixels[0], 0);
        assert!(frame.pixels[(3 * 4) as usize] > 0);
    }

    #[test]
    fn checker_alternates_cells() {
        let camera = SyntheticCamera::new(&CameraSection {
            width: 64,
            height: 1,
            pattern: CameraPattern::Checker,
            ..CameraSection::default()
        });
        let frame = camera.frame(0);
        assert_eq!(frame.pixels[0], 235);
        assert_eq!(frame.pixels[32 * 4], 20);
    }
}
