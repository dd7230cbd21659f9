//! Seam between the engine and a concrete graphics API.
//!
//! A [`RenderBackend`] is handed to the engine on the owner thread and turned
//! into a [`GraphicsContext`] on the render thread. Everything the engine
//! needs from the GPU goes through the context: surfaces, programs, textures,
//! draws and presentation. The wgpu implementation lives in [`crate::gpu`].

use crate::compile::ShaderProgram;
use crate::frame_source::CameraImage;
use crate::geometry::GeometryBuffers;
use crate::recording::EncoderInput;
use crate::types::LoadedTexture;
use crate::uniforms::CameraUniforms;
use crate::viewport::Viewport;

/// Handle to a drawable surface owned by a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

/// Handle to a linked program. Valid from link until deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

/// What a surface presents to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Preview,
    Recording,
}

#[derive(Clone, Debug)]
pub struct ContextRequest {
    pub preview_size: (u32, u32),
    pub recordable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextCapabilities {
    /// Surfaces can be copied into each other without a redraw.
    pub framebuffer_blit: bool,
    pub max_texture_dimension: u32,
    pub adapter_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("graphics context could not be created: {0}")]
    Context(String),
    #[error("surface could not be created: {0}")]
    Surface(String),
    #[error("program could not be linked: {0}")]
    Program(String),
    #[error("texture upload failed: {0}")]
    Texture(String),
    #[error(transparent)]
    Gpu(#[from] anyhow::Error),
}

/// Per-frame presentation failures, classified by how the engine reacts.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// The surface is gone for good; the engine shuts down.
    #[error("surface lost")]
    Lost,
    #[error("out of GPU memory")]
    OutOfMemory,
    /// Acquisition timed out or the surface needs reconfiguring; the frame is skipped.
    #[error("surface temporarily unavailable: {0}")]
    Transient(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    /// The encoder refused a frame handed to it.
    #[error("encoder rejected frame: {0}")]
    Encoder(#[from] std::io::Error),
}

impl SurfaceError {
    /// Whether the failure should take the engine down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SurfaceError::Lost | SurfaceError::OutOfMemory)
    }
}

/// One draw of the shared quad.
#[derive(Debug)]
pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub viewport: Viewport,
    pub clear_color: [f32; 4],
    pub camera: &'a CameraUniforms,
    /// Packed custom parameter block, empty when the program has none.
    pub params: &'a [u8],
}

/// Creates a graphics context on the render thread.
pub trait RenderBackend: Send + 'static {
    fn create_context(
        self: Box<Self>,
        request: &ContextRequest,
    ) -> Result<Box<dyn GraphicsContext>, BackendError>;
}

/// GPU operations the engine performs. Implementations may assume every call
/// arrives on the thread that created the context.
pub trait GraphicsContext {
    fn capabilities(&self) -> ContextCapabilities;

    /// Uploads the shared quad geometry. Called once before any program is linked.
    fn upload_geometry(&mut self, geometry: &GeometryBuffers) -> Result<(), BackendError>;

    fn create_preview_surface(&mut self) -> Result<(SurfaceId, (u32, u32)), BackendError>;

    fn create_encoder_surface(&mut self, input: &EncoderInput) -> Result<SurfaceId, BackendError>;

    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Directs subsequent draws at `surface`, acquiring its next image if needed.
    fn make_current(&mut self, surface: SurfaceId) -> Result<(), SurfaceError>;

    fn link_program(&mut self, program: &ShaderProgram) -> Result<ProgramHandle, BackendError>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn upload_texture(&mut self, texture: &LoadedTexture) -> Result<(), BackendError>;

    /// Replaces the contents of the camera texture, resizing it when the image size changes.
    fn update_camera_texture(&mut self, image: &CameraImage) -> Result<(), BackendError>;

    /// Draws the quad into the current surface.
    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), SurfaceError>;

    /// Copies the colour contents of `source` into `target`.
    fn blit(&mut self, source: SurfaceId, target: SurfaceId) -> Result<(), SurfaceError>;

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: i64);

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), SurfaceError>;

    /// Tears the context down. No surfaces may remain.
    fn release(&mut self);
}
