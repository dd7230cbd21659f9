//! Recording test double for the graphics seam plus helpers shared by the engine tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use shadercam::compile::{PASSTHROUGH_FRAGMENT, PASSTHROUGH_VERTEX};
use shadercam::{
    BackendError, CameraImage, ContextCapabilities, ContextRequest, DrawCall, Encoder,
    EncoderError, EncoderInput, EncoderSettings, EngineConfig, FrameSink, GeometryBuffers,
    GraphicsContext, LoadedTexture, ProgramHandle, RenderBackend, ShaderPaths, ShaderProgram,
    SurfaceError, SurfaceId, VideoFrame, Viewport, Y4mEncoder,
};

/// Everything the fake context and the logging encoder observed, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    UploadGeometry,
    CreatePreview(SurfaceId),
    CreateEncoderSurface(SurfaceId),
    DestroySurface(SurfaceId),
    MakeCurrent(SurfaceId),
    Link(ProgramHandle),
    DeleteProgram(ProgramHandle),
    UploadTexture(String),
    CameraTexture { width: u32, height: u32, marker: u8 },
    Draw { surface: SurfaceId, viewport: Viewport },
    Blit { source: SurfaceId, target: SurfaceId },
    PresentationTime { surface: SurfaceId, nanos: i64 },
    Swap(SurfaceId),
    Release,
    EncoderPrepare,
    EncoderStart,
    EncoderStop,
    EncoderRelease,
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, call: Call) {
        self.lock().push(call);
    }

    pub fn snapshot(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.lock().iter().filter(|call| predicate(call)).count()
    }

    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().position(predicate)
    }

    pub fn rposition(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().rposition(predicate)
    }
}

/// Knobs for the fake context.
#[derive(Clone, Debug, Default)]
pub struct FakeOptions {
    pub framebuffer_blit: bool,
    pub fail_context: bool,
    /// The preview swap fails with `SurfaceError::Lost` once this many swaps succeeded.
    pub lose_preview_after: Option<usize>,
}

pub struct FakeBackend {
    log: CallLog,
    options: FakeOptions,
}

impl FakeBackend {
    pub fn new(log: CallLog) -> Self {
        Self::with_options(log, FakeOptions::default())
    }

    pub fn with_options(log: CallLog, options: FakeOptions) -> Self {
        Self { log, options }
    }
}

impl RenderBackend for FakeBackend {
    fn create_context(
        self: Box<Self>,
        request: &ContextRequest,
    ) -> Result<Box<dyn GraphicsContext>, BackendError> {
        if self.options.fail_context {
            return Err(BackendError::Context("no display available".into()));
        }
        Ok(Box::new(FakeContext {
            log: self.log,
            options: self.options,
            preview_size: request.preview_size,
            preview: None,
            encoders: BTreeMap::new(),
            presentation: BTreeMap::new(),
            current: None,
            marker: 0,
            preview_swaps: 0,
            next_id: 1,
        }))
    }
}

struct FakeContext {
    log: CallLog,
    options: FakeOptions,
    preview_size: (u32, u32),
    preview: Option<SurfaceId>,
    encoders: BTreeMap<SurfaceId, EncoderInput>,
    presentation: BTreeMap<SurfaceId, i64>,
    current: Option<SurfaceId>,
    marker: u8,
    preview_swaps: usize,
    next_id: u32,
}

impl FakeContext {
    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl GraphicsContext for FakeContext {
    fn capabilities(&self) -> ContextCapabilities {
        ContextCapabilities {
            framebuffer_blit: self.options.framebuffer_blit,
            max_texture_dimension: 4096,
            adapter_name: "fake".into(),
        }
    }

    fn upload_geometry(&mut self, geometry: &GeometryBuffers) -> Result<(), BackendError> {
        assert_eq!(geometry.index_count(), 6);
        self.log.push(Call::UploadGeometry);
        Ok(())
    }

    fn create_preview_surface(&mut self) -> Result<(SurfaceId, (u32, u32)), BackendError> {
        let id = SurfaceId(self.next());
        self.preview = Some(id);
        self.log.push(Call::CreatePreview(id));
        Ok((id, self.preview_size))
    }

    fn create_encoder_surface(&mut self, input: &EncoderInput) -> Result<SurfaceId, BackendError> {
        let id = SurfaceId(self.next());
        self.encoders.insert(id, input.clone());
        self.log.push(Call::CreateEncoderSurface(id));
        Ok(id)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        self.encoders.remove(&surface);
        if self.preview == Some(surface) {
            self.preview = None;
        }
        self.log.push(Call::DestroySurface(surface));
    }

    fn make_current(&mut self, surface: SurfaceId) -> Result<(), SurfaceError> {
        self.current = Some(surface);
        self.log.push(Call::MakeCurrent(surface));
        Ok(())
    }

    fn link_program(&mut self, program: &ShaderProgram) -> Result<ProgramHandle, BackendError> {
        assert!(program.uniform_location("camTexture").is_some());
        let handle = ProgramHandle(self.next());
        self.log.push(Call::Link(handle));
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.log.push(Call::DeleteProgram(program));
    }

    fn upload_texture(&mut self, texture: &LoadedTexture) -> Result<(), BackendError> {
        self.log
            .push(Call::UploadTexture(texture.slot.uniform_name.clone()));
        Ok(())
    }

    fn update_camera_texture(&mut self, image: &CameraImage) -> Result<(), BackendError> {
        self.marker = image.pixels.first().copied().unwrap_or(0);
        self.log.push(Call::CameraTexture {
            width: image.width,
            height: image.height,
            marker: self.marker,
        });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), SurfaceError> {
        let surface = self.current.expect("draw without a current surface");
        self.log.push(Call::Draw {
            surface,
            viewport: call.viewport,
        });
        Ok(())
    }

    fn blit(&mut self, source: SurfaceId, target: SurfaceId) -> Result<(), SurfaceError> {
        self.log.push(Call::Blit { source, target });
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: i64) {
        self.presentation.insert(surface, nanos);
        self.log.push(Call::PresentationTime { surface, nanos });
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), SurfaceError> {
        if Some(surface) == self.preview {
            if let Some(limit) = self.options.lose_preview_after {
                if self.preview_swaps >= limit {
                    return Err(SurfaceError::Lost);
                }
            }
            self.preview_swaps += 1;
        }
        self.log.push(Call::Swap(surface));
        if let Some(input) = self.encoders.get(&surface) {
            let data = vec![self.marker; input.width as usize * input.height as usize * 4];
            input.sink.submit(&VideoFrame {
                width: input.width,
                height: input.height,
                data: &data,
                presentation_time_ns: self.presentation.get(&surface).copied().unwrap_or(0),
            })?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.log.push(Call::Release);
    }
}

/// Y4M encoder that also logs its lifecycle into a [`CallLog`].
pub struct LoggingEncoder {
    inner: Y4mEncoder,
    log: CallLog,
}

impl LoggingEncoder {
    pub fn new(log: CallLog) -> Self {
        Self {
            inner: Y4mEncoder::new(),
            log,
        }
    }
}

impl Encoder for LoggingEncoder {
    fn file_extension(&self) -> &str {
        self.inner.file_extension()
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError> {
        self.log.push(Call::EncoderPrepare);
        self.inner.prepare(settings, output)
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        self.log.push(Call::EncoderStart);
        self.inner.start()
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.log.push(Call::EncoderStop);
        self.inner.stop()
    }

    fn release(&mut self) {
        self.log.push(Call::EncoderRelease);
        self.inner.release();
    }
}

/// Sink that rejects every frame, for exercising encoder failures.
pub struct RejectingSink;

impl FrameSink for RejectingSink {
    fn submit(&self, _frame: &VideoFrame<'_>) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "codec went away",
        ))
    }
}

/// Encoder whose input rejects every frame once started.
pub struct RejectingEncoder {
    log: CallLog,
}

impl RejectingEncoder {
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

impl Encoder for RejectingEncoder {
    fn file_extension(&self) -> &str {
        "bin"
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError> {
        self.log.push(Call::EncoderPrepare);
        fs::write(output, b"partial")?;
        Ok(EncoderInput {
            width: settings.width,
            height: settings.height,
            sink: Arc::new(RejectingSink),
        })
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        self.log.push(Call::EncoderStart);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.log.push(Call::EncoderStop);
        Ok(())
    }

    fn release(&mut self) {
        self.log.push(Call::EncoderRelease);
    }
}

/// Writes the pass-through shader pair into `dir` and returns a config using it.
pub fn engine_config(dir: &Path) -> EngineConfig {
    let shaders = ShaderPaths::for_purpose(dir, "camera");
    fs::write(&shaders.vertex, PASSTHROUGH_VERTEX).unwrap();
    fs::write(&shaders.fragment, PASSTHROUGH_FRAGMENT).unwrap();
    let mut config = EngineConfig::new(shaders, (64, 48));
    config.cache_dir = dir.join("cache");
    config.recording = EncoderSettings {
        width: 16,
        height: 16,
        frame_rate: 30,
        ..EncoderSettings::default()
    };
    config
}

/// Solid 8x8 camera image whose first byte identifies it.
pub fn camera_image(marker: u8, timestamp_ns: i64) -> CameraImage {
    CameraImage::new(8, 8, vec![marker; 8 * 8 * 4], timestamp_ns)
}

/// Polls `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn temp_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("temp_mov"))
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}
