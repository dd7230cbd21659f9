use std::collections::BTreeSet;
use std::thread::{self, ThreadId};

use crate::backend::{
    BackendError, ContextCapabilities, ContextRequest, DrawCall, GraphicsContext, ProgramHandle,
    RenderBackend, SurfaceError, SurfaceId, SurfaceKind,
};
use crate::compile::ShaderProgram;
use crate::frame_source::CameraImage;
use crate::geometry::GeometryBuffers;
use crate::recording::EncoderInput;
use crate::types::LoadedTexture;

/// Records which thread owns GPU state and panics when another thread touches it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ThreadAffinity {
    owner: ThreadId,
}

impl ThreadAffinity {
    pub fn current() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    #[track_caller]
    pub fn assert_current(&self, operation: &str) {
        let caller = thread::current();
        assert!(
            caller.id() == self.owner,
            "graphics operation `{operation}` called from thread {:?} ({:?}); GPU state belongs to the render thread",
            caller.name().unwrap_or("<unnamed>"),
            caller.id(),
        );
    }
}

/// Render-thread wrapper around a [`GraphicsContext`].
///
/// Tracks live surfaces and programs so teardown order violations fail loudly
/// instead of corrupting driver state.
pub struct RenderContext {
    inner: Box<dyn GraphicsContext>,
    affinity: ThreadAffinity,
    capabilities: ContextCapabilities,
    surfaces: BTreeSet<SurfaceId>,
    programs: BTreeSet<ProgramHandle>,
}

impl RenderContext {
    /// Creates the context on the calling thread, which becomes its owner.
    pub fn create(
        backend: Box<dyn RenderBackend>,
        request: &ContextRequest,
    ) -> Result<Self, BackendError> {
        let inner = backend.create_context(request)?;
        let capabilities = inner.capabilities();
        tracing::debug!(
            adapter = %capabilities.adapter_name,
            blit = capabilities.framebuffer_blit,
            max_texture = capabilities.max_texture_dimension,
            "graphics context created"
        );
        Ok(Self {
            inner,
            affinity: ThreadAffinity::current(),
            capabilities,
            surfaces: BTreeSet::new(),
            programs: BTreeSet::new(),
        })
    }

    pub fn capabilities(&self) -> &ContextCapabilities {
        &self.capabilities
    }

    /// Surfaces created from this context and not yet released.
    pub fn live_surfaces(&self) -> usize {
        self.surfaces.len()
    }

    pub fn upload_geometry(&mut self, geometry: &GeometryBuffers) -> Result<(), BackendError> {
        self.affinity.assert_current("upload_geometry");
        self.inner.upload_geometry(geometry)
    }

    pub fn create_preview_surface(&mut self) -> Result<DrawSurface, BackendError> {
        self.affinity.assert_current("create_preview_surface");
        let (id, (width, height)) = self.inner.create_preview_surface()?;
        self.surfaces.insert(id);
        Ok(DrawSurface {
            id,
            width,
            height,
            kind: SurfaceKind::Preview,
        })
    }

    pub fn create_recording_surface(
        &mut self,
        input: &EncoderInput,
    ) -> Result<DrawSurface, BackendError> {
        self.affinity.assert_current("create_recording_surface");
        let id = self.inner.create_encoder_surface(input)?;
        self.surfaces.insert(id);
        Ok(DrawSurface {
            id,
            width: input.width,
            height: input.height,
            kind: SurfaceKind::Recording,
        })
    }

    pub fn link_program(&mut self, program: &ShaderProgram) -> Result<ProgramHandle, BackendError> {
        self.affinity.assert_current("link_program");
        let handle = self.inner.link_program(program)?;
        self.programs.insert(handle);
        Ok(handle)
    }

    pub fn delete_program(&mut self, handle: ProgramHandle) {
        self.affinity.assert_current("delete_program");
        if self.programs.remove(&handle) {
            self.inner.delete_program(handle);
        }
    }

    pub fn upload_texture(&mut self, texture: &LoadedTexture) -> Result<(), BackendError> {
        self.affinity.assert_current("upload_texture");
        self.inner.upload_texture(texture)
    }

    pub fn update_camera_texture(&mut self, image: &CameraImage) -> Result<(), BackendError> {
        self.affinity.assert_current("update_camera_texture");
        self.inner.update_camera_texture(image)
    }

    pub fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), SurfaceError> {
        self.affinity.assert_current("draw");
        assert!(
            self.programs.contains(&call.program),
            "draw issued with {:?}, which is not linked in this context",
            call.program
        );
        self.inner.draw(call)
    }

    pub fn blit(&mut self, source: &DrawSurface, target: &DrawSurface) -> Result<(), SurfaceError> {
        self.affinity.assert_current("blit");
        self.inner.blit(source.id, target.id)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        self.affinity.assert_current("destroy_surface");
        if self.surfaces.remove(&id) {
            self.inner.destroy_surface(id);
        }
    }

    /// Deletes remaining programs and releases the context.
    ///
    /// # Panics
    ///
    /// Panics if any surface created from this context is still alive.
    pub fn release(mut self) {
        self.affinity.assert_current("release");
        assert!(
            self.surfaces.is_empty(),
            "graphics context released while {} surface(s) are still bound: {:?}",
            self.surfaces.len(),
            self.surfaces
        );
        let programs: Vec<ProgramHandle> = self.programs.iter().copied().collect();
        for program in programs {
            self.delete_program(program);
        }
        self.inner.release();
        tracing::debug!("graphics context released");
    }
}

/// A drawable bound to a [`RenderContext`]. Must be released before the context.
#[derive(Debug, PartialEq, Eq)]
pub struct DrawSurface {
    id: SurfaceId,
    width: u32,
    height: u32,
    kind: SurfaceKind,
}

impl DrawSurface {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn is_recording_target(&self) -> bool {
        self.kind == SurfaceKind::Recording
    }

    pub fn make_current(&self, context: &mut RenderContext) -> Result<(), SurfaceError> {
        context.affinity.assert_current("make_current");
        context.inner.make_current(self.id)
    }

    pub fn set_presentation_time(&self, context: &mut RenderContext, nanos: i64) {
        context.affinity.assert_current("set_presentation_time");
        context.inner.set_presentation_time(self.id, nanos);
    }

    pub fn swap_buffers(&self, context: &mut RenderContext) -> Result<(), SurfaceError> {
        context.affinity.assert_current("swap_buffers");
        context.inner.swap_buffers(self.id)
    }

    pub fn release(self, context: &mut RenderContext) {
        tracing::debug!(surface = ?self.id, kind = ?self.kind, "releasing draw surface");
        context.destroy_surface(self.id);
    }
}
