//! wgpu implementation of the graphics seam.
//!
//! - `context` owns the instance, adapter and device and implements
//!   [`GraphicsContext`](crate::backend::GraphicsContext) on the render thread.
//! - `pipeline` turns a compiled [`ShaderProgram`](crate::compile::ShaderProgram)
//!   into render pipelines plus the camera, texture and parameter bind groups.
//! - `textures` keeps the camera texture and user texture slots resident.
//! - `surface` wraps the preview swapchain, the headless preview target and the
//!   encoder input whose frames are read back on every swap.
//! - `readback` copies a render target into a mapped staging buffer.
//!
//! Everything here runs on the render thread. The only piece that crosses
//! threads is [`WgpuBackend`], which carries raw window handles until the
//! context is created.

mod context;
mod pipeline;
mod readback;
mod surface;
mod textures;

use anyhow::Context as _;
use raw_window_handle::{
    HandleError, HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};

use crate::backend::{BackendError, ContextRequest, GraphicsContext, RenderBackend};

use self::context::GpuContext;

/// Adapter selection knobs.
#[derive(Clone, Copy, Debug)]
pub struct GpuOptions {
    pub power_preference: wgpu::PowerPreference,
    /// Use a software adapter; handy on CI machines without a GPU.
    pub force_fallback_adapter: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WindowHandles {
    display: RawDisplayHandle,
    window: RawWindowHandle,
}

// SAFETY: the handles are only dereferenced by wgpu on the render thread, and
// `WgpuBackend::for_window` makes the caller responsible for the window outliving it.
unsafe impl Send for WindowHandles {}

pub(crate) enum PreviewTarget {
    Window(WindowHandles),
    Offscreen,
}

/// [`RenderBackend`] that renders through wgpu.
pub struct WgpuBackend {
    target: PreviewTarget,
    options: GpuOptions,
}

impl WgpuBackend {
    /// Backend whose preview is an offscreen texture.
    pub fn offscreen() -> Self {
        Self {
            target: PreviewTarget::Offscreen,
            options: GpuOptions::default(),
        }
    }

    /// Backend presenting the preview into `window`.
    ///
    /// # Safety
    ///
    /// The window must stay alive until the engine using this backend has
    /// terminated.
    pub unsafe fn for_window<W>(window: &W) -> Result<Self, HandleError>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window.display_handle()?.as_raw();
        let window = window.window_handle()?.as_raw();
        Ok(Self {
            target: PreviewTarget::Window(WindowHandles { display, window }),
            options: GpuOptions::default(),
        })
    }

    pub fn with_options(mut self, options: GpuOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            PreviewTarget::Window(_) => "window",
            PreviewTarget::Offscreen => "offscreen",
        };
        f.debug_struct("WgpuBackend")
            .field("target", &target)
            .field("options", &self.options)
            .finish()
    }
}

impl RenderBackend for WgpuBackend {
    fn create_context(
        self: Box<Self>,
        request: &ContextRequest,
    ) -> Result<Box<dyn GraphicsContext>, BackendError> {
        let WgpuBackend { target, options } = *self;
        let context = GpuContext::new(target, options, request)
            .context("wgpu context initialisation failed")?;
        Ok(Box::new(context))
    }
}
