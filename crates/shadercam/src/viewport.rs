/// Pixel rectangle a draw call is restricted to. `x`/`y` are measured from the top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Viewport covering a whole surface.
    pub const fn full(size: (u32, u32)) -> Self {
        Self::new(0, 0, size.0, size.1)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamps the rectangle so it never exceeds a surface of `size`.
    pub fn clamp_to(self, size: (u32, u32)) -> Self {
        let x = self.x.min(size.0);
        let y = self.y.min(size.1);
        Self::new(
            x,
            y,
            self.width.min(size.0 - x),
            self.height.min(size.1 - y),
        )
    }
}

/// Letterboxes camera video of size `video` inside a surface of size `surface`.
///
/// Matching aspect ratios fill the surface. Otherwise the video is scaled to
/// the limiting dimension and centred, leaving bars on the other axis.
pub fn fit_viewport(video: (u32, u32), surface: (u32, u32)) -> Viewport {
    let (video_w, video_h) = video;
    let (surface_w, surface_h) = surface;
    if video_w == 0 || video_h == 0 || surface_w == 0 || surface_h == 0 {
        return Viewport::full(surface);
    }

    // Cross-multiplied aspect comparison avoids float equality.
    let video_area = u64::from(video_w) * u64::from(surface_h);
    let surface_area = u64::from(surface_w) * u64::from(video_h);
    if video_area == surface_area {
        return Viewport::full(surface);
    }

    let (width, height) = if video_area > surface_area {
        // Video is wider than the surface: fill the width.
        let height = (u64::from(video_h) * u64::from(surface_w) / u64::from(video_w)) as u32;
        (surface_w, height.max(1))
    } else {
        let width = (u64::from(video_w) * u64::from(surface_h) / u64::from(video_h)) as u32;
        (width.max(1), surface_h)
    };

    Viewport::new(
        (surface_w - width) / 2,
        (surface_h - height) / 2,
        width,
        height,
    )
}
