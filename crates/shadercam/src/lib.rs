//! Camera-to-shader rendering engine for ShaderCam.
//!
//! Camera images are pushed into a [`FrameProducer`], run through a user GLSL
//! program on a dedicated render thread, and presented to a preview surface.
//! While a recording is active the same frame is copied into an encoder's
//! input surface and stamped with the camera timestamp. The overall flow is:
//!
//! ```text
//!   camera ──▶ FrameProducer ──(latest-only mailbox)──▶ FrameSource
//!                                                          │ FrameAvailable
//!                                                          ▼
//!   RenderEngine ──commands──▶ render thread ──▶ draw_pass(preview) ──▶ swap
//!        ▲                          │
//!        │ EngineEvent              └─▶ blit / redraw(recording) ──▶ Encoder
//!        └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`RenderEngine`] is the owner-side handle: it validates configuration,
//! spawns the render thread and forwards recording requests. Everything GPU
//! related lives behind the [`GraphicsContext`] seam so the engine can be
//! driven by the wgpu backend in [`gpu`] or by a test double. Shaders are
//! plain GLSL that sees the camera texture as `camTexture`, the camera
//! transform as `camTextureTransform` and optional user textures and
//! parameters declared through a uniform block.

pub mod backend;
pub mod binder;
pub mod compile;
pub mod context;
pub mod engine;
pub mod ffmpeg;
pub mod frame_source;
pub mod geometry;
pub mod gpu;
pub mod recording;
pub mod timeline;
pub mod types;
pub mod uniforms;
pub mod viewport;
mod worker;
pub mod y4m;

pub use backend::{
    BackendError, ContextCapabilities, ContextRequest, DrawCall, GraphicsContext, ProgramHandle,
    RenderBackend, SurfaceError, SurfaceId, SurfaceKind,
};
pub use binder::{
    FrameInfo, PassthroughBinder, ShaderParameterBinder, TileTimeBinder, TouchColorBinder,
    TouchPoint,
};
pub use compile::{ShaderError, ShaderProgram, ShaderProgramCompiler, ShaderStage};
pub use context::{DrawSurface, RenderContext};
pub use engine::{
    EngineError, EngineEvent, EngineState, EngineStats, FinishReason, RecordingPhase,
    RenderEngine,
};
pub use ffmpeg::FfmpegEncoder;
pub use frame_source::{CameraImage, FrameProducer, FrameSource, FrameSourceError, FrameStamp};
pub use geometry::GeometryBuffers;
pub use gpu::{GpuOptions, WgpuBackend};
pub use recording::{
    Encoder, EncoderError, EncoderInput, EncoderSettings, FrameSink, RecordingController,
    RecordingError, RecordingOutcome, RecordingSession, VideoFrame,
};
pub use timeline::{FrameTimeline, Placement};
pub use types::{
    CopyStrategy, EngineConfig, LoadedTexture, ShaderPaths, ShaderSources, TextureBindings,
    TextureError, TextureSlot, TextureSource,
};
pub use uniforms::{CameraUniforms, ParamsBlock, UniformError, UniformWriter};
pub use viewport::{fit_viewport, Viewport};
pub use y4m::{Y4mEncoder, Y4mInfo};
