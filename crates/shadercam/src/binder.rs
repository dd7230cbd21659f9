//! Per-draw custom uniform strategies.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::SurfaceKind;
use crate::uniforms::{UniformError, UniformWriter};
use crate::viewport::Viewport;

/// What the binder is drawing for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
    /// Index of the camera frame, counted from the first rendered frame.
    pub frame_index: u64,
    pub timestamp_ns: i64,
    /// Camera time since the first rendered frame.
    pub elapsed: Duration,
    pub surface_size: (u32, u32),
    pub viewport: Viewport,
    pub target: SurfaceKind,
}

/// Pushes custom uniform values before every draw.
///
/// Called once per draw pass, so a recording frame rendered by redraw invokes
/// the binder twice with different [`FrameInfo::target`]s. The writer only
/// reaches the custom parameter block.
pub trait ShaderParameterBinder: Send {
    fn bind(&mut self, uniforms: &mut UniformWriter<'_>, frame: &FrameInfo);
}

impl<F> ShaderParameterBinder for F
where
    F: FnMut(&mut UniformWriter<'_>, &FrameInfo) + Send,
{
    fn bind(&mut self, uniforms: &mut UniformWriter<'_>, frame: &FrameInfo) {
        self(uniforms, frame)
    }
}

fn report(result: Result<(), UniformError>) {
    if let Err(err) = result {
        tracing::trace!(%err, "uniform write skipped");
    }
}

/// Binds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughBinder;

impl ShaderParameterBinder for PassthroughBinder {
    fn bind(&mut self, _uniforms: &mut UniformWriter<'_>, _frame: &FrameInfo) {}
}

/// Latest touch position in surface pixels, shared between the input side and a binder.
#[derive(Clone, Debug, Default)]
pub struct TouchPoint {
    x: Arc<AtomicU32>,
    y: Arc<AtomicU32>,
    touched: Arc<AtomicBool>,
}

impl TouchPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, x: f32, y: f32) {
        self.x.store(x.to_bits(), Ordering::Relaxed);
        self.y.store(y.to_bits(), Ordering::Relaxed);
        self.touched.store(true, Ordering::Release);
    }

    /// `None` until the first [`set`](Self::set).
    pub fn get(&self) -> Option<(f32, f32)> {
        if !self.touched.load(Ordering::Acquire) {
            return None;
        }
        Some((
            f32::from_bits(self.x.load(Ordering::Relaxed)),
            f32::from_bits(self.y.load(Ordering::Relaxed)),
        ))
    }
}

/// Tints the image from the touch position: `offsetR = x / width`,
/// `offsetG = y / height`, `offsetB = offsetR / offsetG`. All three are 0.5
/// until the first touch.
#[derive(Clone, Debug)]
pub struct TouchColorBinder {
    touch: TouchPoint,
}

impl TouchColorBinder {
    pub fn new(touch: TouchPoint) -> Self {
        Self { touch }
    }

    pub const UNTOUCHED_OFFSET: f32 = 0.5;

    fn offsets(&self, surface: (u32, u32)) -> [f32; 3] {
        let Some((x, y)) = self.touch.get() else {
            return [Self::UNTOUCHED_OFFSET; 3];
        };
        let ratio = |value: f32, extent: u32| {
            if extent == 0 {
                0.0
            } else {
                value / extent as f32
            }
        };
        let r = ratio(x, surface.0);
        let g = ratio(y, surface.1);
        let b = if g == 0.0 { 0.0 } else { r / g };
        [r, g, b]
    }
}

impl ShaderParameterBinder for TouchColorBinder {
    fn bind(&mut self, uniforms: &mut UniformWriter<'_>, frame: &FrameInfo) {
        let [r, g, b] = self.offsets(frame.surface_size);
        report(uniforms.set_float("offsetR", r));
        report(uniforms.set_float("offsetG", g));
        report(uniforms.set_float("offsetB", b));
    }
}

/// Drives tiling shaders with elapsed seconds in `iGlobalTime` and the tile
/// count in `iResolution`.
#[derive(Clone, Debug)]
pub struct TileTimeBinder {
    tiles: f32,
}

impl TileTimeBinder {
    pub const DEFAULT_TILES: f32 = 1.0;

    pub fn new(tiles: f32) -> Self {
        Self { tiles }
    }
}

impl Default for TileTimeBinder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TILES)
    }
}

impl ShaderParameterBinder for TileTimeBinder {
    fn bind(&mut self, uniforms: &mut UniformWriter<'_>, frame: &FrameInfo) {
        report(uniforms.set_float("iGlobalTime", frame.elapsed.as_secs_f32()));
        report(uniforms.set_vec3("iResolution", [self.tiles, self.tiles, 1.0]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{UniformBlockLayout, UniformKind, UniformMember};
    use crate::uniforms::ParamsBlock;

    fn block(members: &[(&str, u32, UniformKind)], size: u32) -> ParamsBlock {
        let layout = UniformBlockLayout {
            name: Some("Params".into()),
            group: 2,
            binding: 0,
            size,
            members: members
                .iter()
                .map(|(name, offset, kind)| UniformMember {
                    name: name.to_string(),
                    offset: *offset,
                    kind: *kind,
                })
                .collect(),
        };
        ParamsBlock::new(Some(&layout))
    }

    fn frame(elapsed: Duration) -> FrameInfo {
        FrameInfo {
            frame_index: 3,
            timestamp_ns: elapsed.as_nanos() as i64,
            elapsed,
            surface_size: (200, 100),
            viewport: Viewport::new(0, 0, 200, 100),
            target: SurfaceKind::Preview,
        }
    }

    fn float_at(bytes: &[u8], offset: usize) -> f32 {
        f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn touch_offsets_follow_the_touch_point() {
        let touch = TouchPoint::new();
        let mut binder = TouchColorBinder::new(touch.clone());
        let mut params = block(
            &[
                ("offsetR", 0, UniformKind::Float),
                ("offsetG", 4, UniformKind::Float),
                ("offsetB", 8, UniformKind::Float),
            ],
            16,
        );

        touch.set(50.0, 50.0);
        binder.bind(&mut params.writer(), &frame(Duration::ZERO));

        let bytes = params.bytes();
        assert_eq!(float_at(bytes, 0), 0.25);
        assert_eq!(float_at(bytes, 4), 0.5);
        assert_eq!(float_at(bytes, 8), 0.5);
    }

    #[test]
    fn untouched_offsets_start_at_half() {
        let binder = TouchColorBinder::new(TouchPoint::new());
        assert_eq!(binder.offsets((640, 480)), [0.5, 0.5, 0.5]);
    }

    #[test]
    fn touch_at_origin_does_not_divide_by_zero() {
        let touch = TouchPoint::new();
        let binder = TouchColorBinder::new(touch.clone());
        touch.set(0.0, 0.0);
        assert_eq!(binder.offsets((640, 480)), [0.0, 0.0, 0.0]);
        assert_eq!(binder.offsets((0, 0)), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn default_tile_binder_uses_a_single_tile() {
        let mut params = block(&[("iResolution", 0, UniformKind::Vec3)], 16);
        TileTimeBinder::default().bind(&mut params.writer(), &frame(Duration::ZERO));
        assert_eq!(float_at(params.bytes(), 0), 1.0);
        assert_eq!(float_at(params.bytes(), 4), 1.0);
    }

    #[test]
    fn tile_binder_writes_time_and_tile_count() {
        let mut binder = TileTimeBinder::new(40.0);
        let mut params = block(
            &[
                ("iGlobalTime", 0, UniformKind::Float),
                ("iResolution", 16, UniformKind::Vec3),
            ],
            32,
        );
        binder.bind(&mut params.writer(), &frame(Duration::from_millis(1500)));

        let bytes = params.bytes();
        assert_eq!(float_at(bytes, 0), 1.5);
        assert_eq!(float_at(bytes, 16), 40.0);
        assert_eq!(float_at(bytes, 20), 40.0);
        assert_eq!(float_at(bytes, 24), 1.0);
    }

    #[test]
    fn binders_tolerate_programs_without_their_uniforms() {
        let mut params = ParamsBlock::new(None);
        TileTimeBinder::default().bind(&mut params.writer(), &frame(Duration::from_secs(1)));
        TouchColorBinder::new(TouchPoint::new())
            .bind(&mut params.writer(), &frame(Duration::from_secs(1)));
        assert!(params.is_empty());
    }

    #[test]
    fn closures_are_binders() {
        let mut seen = Vec::new();
        {
            let mut binder = |_: &mut UniformWriter<'_>, frame: &FrameInfo| seen.push(frame.target);
            let mut params = ParamsBlock::new(None);
            binder.bind(&mut params.writer(), &frame(Duration::ZERO));
        }
        assert_eq!(seen, vec![SurfaceKind::Preview]);
    }
}
