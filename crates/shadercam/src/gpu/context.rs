use std::collections::BTreeMap;

use anyhow::{anyhow, Context as AnyhowContext, Result};

use crate::backend::{
    BackendError, ContextCapabilities, ContextRequest, DrawCall, GraphicsContext, ProgramHandle,
    SurfaceError, SurfaceId,
};
use crate::compile::ShaderProgram;
use crate::frame_source::CameraImage;
use crate::geometry::GeometryBuffers;
use crate::recording::EncoderInput;
use crate::types::LoadedTexture;

use super::pipeline::{GeometryGpu, ShaderPipeline};
use super::surface::{SurfaceTarget, WindowSurface};
use super::textures::TextureSet;
use super::{GpuOptions, PreviewTarget};

/// wgpu implementation of [`GraphicsContext`].
pub(crate) struct GpuContext {
    _instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: ContextCapabilities,
    preview: Option<PendingPreview>,
    geometry: Option<GeometryGpu>,
    textures: TextureSet,
    programs: BTreeMap<ProgramHandle, ShaderPipeline>,
    surfaces: BTreeMap<SurfaceId, SurfaceTarget>,
    current: Option<SurfaceId>,
    next_id: u32,
}

/// Preview target waiting for `create_preview_surface`.
enum PendingPreview {
    Window {
        surface: wgpu::Surface<'static>,
        size: (u32, u32),
    },
    Offscreen {
        size: (u32, u32),
    },
}

impl GpuContext {
    pub(crate) fn new(
        target: PreviewTarget,
        options: GpuOptions,
        request: &ContextRequest,
    ) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let size = (request.preview_size.0.max(1), request.preview_size.1.max(1));
        let preview = match target {
            PreviewTarget::Window(handles) => {
                // SAFETY: the caller of `WgpuBackend::for_window` guarantees the window
                // outlives the engine.
                let surface = unsafe {
                    instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                        raw_display_handle: handles.display,
                        raw_window_handle: handles.window,
                    })
                }
                .context("failed to create rendering surface")?;
                PendingPreview::Window { surface, size }
            }
            PreviewTarget::Offscreen => PendingPreview::Offscreen { size },
        };

        let compatible_surface = match &preview {
            PendingPreview::Window { surface, .. } => Some(surface),
            PendingPreview::Offscreen { .. } => None,
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .context("failed to find a suitable GPU adapter")?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let max_dimension = limits.max_texture_dimension_2d;
        if size.0 > max_dimension || size.1 > max_dimension {
            anyhow::bail!(
                "GPU max texture dimension is {max_dimension}, requested preview is {}x{}",
                size.0,
                size.1
            );
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("shadercam device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        let framebuffer_blit = match &preview {
            PendingPreview::Window { surface, .. } => surface
                .get_capabilities(&adapter)
                .usages
                .contains(wgpu::TextureUsages::COPY_SRC),
            PendingPreview::Offscreen { .. } => true,
        };
        let textures = TextureSet::new(&device, &queue);

        Ok(Self {
            _instance: instance,
            adapter,
            device,
            queue,
            capabilities: ContextCapabilities {
                framebuffer_blit,
                max_texture_dimension: max_dimension,
                adapter_name: info.name,
            },
            preview: Some(preview),
            geometry: None,
            textures,
            programs: BTreeMap::new(),
            surfaces: BTreeMap::new(),
            current: None,
            next_id: 1,
        })
    }

    fn insert_surface(&mut self, target: SurfaceTarget) -> SurfaceId {
        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        self.surfaces.insert(id, target);
        id
    }

    fn window_config(
        &self,
        surface: &wgpu::Surface<'static>,
        size: (u32, u32),
    ) -> Result<wgpu::SurfaceConfiguration> {
        let caps = surface.get_capabilities(&self.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no supported formats"))?;
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if caps.usages.contains(wgpu::TextureUsages::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        } else {
            tracing::warn!("surface does not advertise COPY_SRC; recording will redraw");
        }
        let present_mode = caps
            .present_modes
            .iter()
            .copied()
            .find(|mode| *mode == wgpu::PresentMode::Fifo)
            .or_else(|| caps.present_modes.first().copied())
            .unwrap_or(wgpu::PresentMode::Fifo);
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);
        tracing::debug!(?format, ?present_mode, "configuring preview surface");
        Ok(wgpu::SurfaceConfiguration {
            usage,
            format,
            width: size.0,
            height: size.1,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        })
    }

    fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut SurfaceTarget, SurfaceError> {
        self.surfaces.get_mut(&id).ok_or(SurfaceError::Lost)
    }
}

impl GraphicsContext for GpuContext {
    fn capabilities(&self) -> ContextCapabilities {
        self.capabilities.clone()
    }

    fn upload_geometry(&mut self, geometry: &GeometryBuffers) -> Result<(), BackendError> {
        self.geometry = Some(GeometryGpu::upload(&self.device, geometry));
        Ok(())
    }

    fn create_preview_surface(&mut self) -> Result<(SurfaceId, (u32, u32)), BackendError> {
        let pending = self
            .preview
            .take()
            .ok_or_else(|| BackendError::Surface("preview surface already created".into()))?;
        let (target, size) = match pending {
            PendingPreview::Window { surface, size } => {
                let config = self
                    .window_config(&surface, size)
                    .map_err(|err| BackendError::Surface(format!("{err:#}")))?;
                (
                    SurfaceTarget::Window(WindowSurface::new(surface, config, &self.device)),
                    size,
                )
            }
            PendingPreview::Offscreen { size } => {
                (SurfaceTarget::offscreen(&self.device, size), size)
            }
        };
        Ok((self.insert_surface(target), size))
    }

    fn create_encoder_surface(&mut self, input: &EncoderInput) -> Result<SurfaceId, BackendError> {
        let max = self.capabilities.max_texture_dimension;
        if input.width == 0 || input.height == 0 || input.width > max || input.height > max {
            return Err(BackendError::Surface(format!(
                "encoder surface {}x{} is outside 1..={max}",
                input.width, input.height
            )));
        }
        let target = SurfaceTarget::encoder(
            &self.device,
            (input.width, input.height),
            input.sink.clone(),
        );
        Ok(self.insert_surface(target))
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if self.current == Some(surface) {
            self.current = None;
        }
        self.surfaces.remove(&surface);
    }

    fn make_current(&mut self, surface: SurfaceId) -> Result<(), SurfaceError> {
        let device = self.device.clone();
        self.surface_mut(surface)?.make_current(&device)?;
        self.current = Some(surface);
        Ok(())
    }

    fn link_program(&mut self, program: &ShaderProgram) -> Result<ProgramHandle, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = ShaderPipeline::new(&self.device, program);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Program(err.to_string()));
        }
        let handle = ProgramHandle(self.next_id);
        self.next_id += 1;
        self.programs.insert(handle, pipeline);
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn upload_texture(&mut self, texture: &LoadedTexture) -> Result<(), BackendError> {
        let (width, height) = texture.image.dimensions();
        let max = self.capabilities.max_texture_dimension;
        if width > max || height > max {
            return Err(BackendError::Texture(format!(
                "{} is {width}x{height}, larger than the GPU limit {max}",
                texture.slot.uniform_name
            )));
        }
        self.textures.upload_slot(&self.device, &self.queue, texture);
        Ok(())
    }

    fn update_camera_texture(&mut self, image: &CameraImage) -> Result<(), BackendError> {
        let max = self.capabilities.max_texture_dimension;
        if image.width > max || image.height > max {
            return Err(BackendError::Texture(format!(
                "camera image {}x{} exceeds the GPU limit {max}",
                image.width, image.height
            )));
        }
        self.textures.update_camera(
            &self.device,
            &self.queue,
            (image.width, image.height),
            &image.pixels,
        );
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), SurfaceError> {
        let current = self
            .current
            .ok_or_else(|| SurfaceError::Unsupported("draw without a current surface".into()))?;
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| SurfaceError::Unsupported("geometry not uploaded".into()))?;
        let target = self.surfaces.get(&current).ok_or(SurfaceError::Lost)?;
        let format = target.format();
        let view = target
            .texture()
            .ok_or_else(|| SurfaceError::Transient("surface has no acquired frame".into()))?
            .create_view(&wgpu::TextureViewDescriptor::default());
        let pipeline = self
            .programs
            .get_mut(&call.program)
            .ok_or_else(|| SurfaceError::Unsupported(format!("{:?} is not linked", call.program)))?;

        pipeline.bind_textures(&self.device, &self.textures);
        pipeline.write_uniforms(&self.queue, call.camera, call.params);
        let render_pipeline = pipeline.pipeline_for(&self.device, format);

        let [r, g, b, a] = call.clear_color.map(f64::from);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("shadercam draw"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("shadercam pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            let viewport = call.viewport;
            if !viewport.is_empty() {
                pass.set_viewport(
                    viewport.x as f32,
                    viewport.y as f32,
                    viewport.width as f32,
                    viewport.height as f32,
                    0.0,
                    1.0,
                );
                pipeline.encode(&mut pass, &render_pipeline, geometry);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn blit(&mut self, source: SurfaceId, target: SurfaceId) -> Result<(), SurfaceError> {
        let from = self.surfaces.get(&source).ok_or(SurfaceError::Lost)?;
        let to = self.surfaces.get(&target).ok_or(SurfaceError::Lost)?;
        if !from.can_copy_from() {
            return Err(SurfaceError::Unsupported("source surface is not copyable".into()));
        }
        if from.size() != to.size() || from.format() != to.format() {
            return Err(SurfaceError::Unsupported(format!(
                "cannot blit {:?} {:?} into {:?} {:?}",
                from.size(),
                from.format(),
                to.size(),
                to.format()
            )));
        }
        let (Some(src), Some(dst)) = (from.texture(), to.texture()) else {
            return Err(SurfaceError::Transient("surface has no acquired frame".into()));
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("shadercam blit"),
            });
        encoder.copy_texture_to_texture(
            src.as_image_copy(),
            dst.as_image_copy(),
            wgpu::Extent3d {
                width: from.size().0,
                height: from.size().1,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: i64) {
        if let Some(target) = self.surfaces.get_mut(&surface) {
            target.set_presentation_time(nanos);
        }
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), SurfaceError> {
        let device = self.device.clone();
        let queue = self.queue.clone();
        self.surface_mut(surface)?.swap(&device, &queue)
    }

    fn release(&mut self) {
        self.programs.clear();
        self.surfaces.clear();
        self.geometry = None;
        self.preview = None;
        self.current = None;
        if let Err(err) = self.device.poll(wgpu::PollType::Wait) {
            tracing::warn!(error = %err, "device poll failed during release");
        }
        tracing::debug!(adapter = %self.capabilities.adapter_name, "wgpu context released");
    }
}
