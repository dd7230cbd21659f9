use std::sync::Arc;

use crate::backend::SurfaceError;
use crate::recording::{FrameSink, VideoFrame};

use super::readback::Readback;
use super::textures::extent;

/// Format of offscreen and encoder render targets.
pub(crate) const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub(crate) fn map_surface_error(err: wgpu::SurfaceError) -> SurfaceError {
    match err {
        wgpu::SurfaceError::Lost => SurfaceError::Lost,
        wgpu::SurfaceError::OutOfMemory => SurfaceError::OutOfMemory,
        other => SurfaceError::Transient(other.to_string()),
    }
}

fn create_target(device: &wgpu::Device, label: &str, size: (u32, u32)) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent(size),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

/// Swapchain-backed preview bound to a platform window.
pub(crate) struct WindowSurface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    frame: Option<wgpu::SurfaceTexture>,
}

impl WindowSurface {
    pub fn new(
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        device: &wgpu::Device,
    ) -> Self {
        surface.configure(device, &config);
        Self {
            surface,
            config,
            frame: None,
        }
    }

    fn acquire(&mut self, device: &wgpu::Device) -> Result<(), SurfaceError> {
        if self.frame.is_some() {
            return Ok(());
        }
        match self.surface.get_current_texture() {
            Ok(frame) => {
                if frame.suboptimal {
                    tracing::debug!("surface frame is suboptimal");
                }
                self.frame = Some(frame);
                Ok(())
            }
            Err(wgpu::SurfaceError::Outdated) => {
                self.surface.configure(device, &self.config);
                Err(SurfaceError::Transient("surface outdated; reconfigured".into()))
            }
            Err(err) => Err(map_surface_error(err)),
        }
    }
}

/// Preview rendered into a texture that nobody displays; used headless.
pub(crate) struct OffscreenSurface {
    texture: wgpu::Texture,
}

/// Encoder input: frames are read back and handed to the encoder's sink on swap.
pub(crate) struct EncoderSurface {
    texture: wgpu::Texture,
    sink: Arc<dyn FrameSink>,
    readback: Readback,
    presentation_time_ns: i64,
}

pub(crate) enum SurfaceTarget {
    Window(WindowSurface),
    Offscreen(OffscreenSurface),
    Encoder(EncoderSurface),
}

impl SurfaceTarget {
    pub fn offscreen(device: &wgpu::Device, size: (u32, u32)) -> Self {
        Self::Offscreen(OffscreenSurface {
            texture: create_target(device, "offscreen preview", size),
        })
    }

    pub fn encoder(device: &wgpu::Device, size: (u32, u32), sink: Arc<dyn FrameSink>) -> Self {
        Self::Encoder(EncoderSurface {
            texture: create_target(device, "encoder input", size),
            sink,
            readback: Readback::new(device, size.0, size.1),
            presentation_time_ns: 0,
        })
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        match self {
            Self::Window(window) => window.config.format,
            Self::Offscreen(_) | Self::Encoder(_) => TARGET_FORMAT,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            Self::Window(window) => (window.config.width, window.config.height),
            Self::Offscreen(offscreen) => dims(&offscreen.texture),
            Self::Encoder(encoder) => dims(&encoder.texture),
        }
    }

    /// Whether the colour buffer can be the source of a copy.
    pub fn can_copy_from(&self) -> bool {
        match self {
            Self::Window(window) => window.config.usage.contains(wgpu::TextureUsages::COPY_SRC),
            Self::Offscreen(_) | Self::Encoder(_) => true,
        }
    }

    /// Acquires the next swapchain image where there is one.
    pub fn make_current(&mut self, device: &wgpu::Device) -> Result<(), SurfaceError> {
        match self {
            Self::Window(window) => window.acquire(device),
            Self::Offscreen(_) | Self::Encoder(_) => Ok(()),
        }
    }

    /// Texture currently receiving draws. `None` for a window that has not acquired a frame.
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        match self {
            Self::Window(window) => window.frame.as_ref().map(|frame| &frame.texture),
            Self::Offscreen(offscreen) => Some(&offscreen.texture),
            Self::Encoder(encoder) => Some(&encoder.texture),
        }
    }

    pub fn set_presentation_time(&mut self, nanos: i64) {
        if let Self::Encoder(encoder) = self {
            encoder.presentation_time_ns = nanos;
        }
    }

    /// Presents the window frame, or reads the encoder frame back and submits it.
    pub fn swap(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<(), SurfaceError> {
        match self {
            Self::Window(window) => {
                let frame = window
                    .frame
                    .take()
                    .ok_or_else(|| SurfaceError::Transient("no frame acquired".into()))?;
                frame.present();
                Ok(())
            }
            Self::Offscreen(_) => {
                queue.submit(std::iter::empty());
                Ok(())
            }
            Self::Encoder(encoder) => {
                let (width, height) = dims(&encoder.texture);
                let pixels = encoder
                    .readback
                    .read(device, queue, &encoder.texture)
                    .map_err(|err| SurfaceError::Transient(format!("{err:#}")))?;
                encoder.sink.submit(&VideoFrame {
                    width,
                    height,
                    data: pixels,
                    presentation_time_ns: encoder.presentation_time_ns,
                })?;
                Ok(())
            }
        }
    }
}

fn dims(texture: &wgpu::Texture) -> (u32, u32) {
    (texture.width(), texture.height())
}
