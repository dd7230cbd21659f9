use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use camconfig::{BinderKind, BinderSection, CamConfig, CopyMode, EncoderKind, RecordingSection};
use crossbeam_channel::Receiver;
use shadercam::types::DEFAULT_SHADER_PURPOSE;
use shadercam::{
    CopyStrategy, Encoder, EncoderError, EncoderInput, EncoderSettings, EngineConfig, EngineEvent,
    FfmpegEncoder, FinishReason, FrameInfo, GpuOptions, PassthroughBinder, RenderEngine, ShaderParameterBinder, ShaderPaths,
    ShaderProgramCompiler, TextureBindings, TextureSource, TileTimeBinder, TouchColorBinder,
    TouchPoint, UniformWriter, WgpuBackend, Y4mEncoder,
};
use tracing_subscriber::EnvFilter;

use crate::camera::SyntheticCamera;
use crate::cli::{BinderArg, CheckArgs, CopyArg, EncoderArg, RunArgs, ShaderArgs};
use crate::paths::{timestamped_output, AppPaths};

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const FINISH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let mut config = load_config(&args.shaders, &paths)?;
    apply_run_overrides(&mut config, &args);
    config
        .validate()
        .context("command line overrides produced an invalid configuration")?;

    let engine_config = build_engine_config(&config, &args.shaders, &paths)?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        cache = %engine_config.cache_dir.display(),
        vertex = %engine_config.shaders.vertex.display(),
        fragment = %engine_config.shaders.fragment.display(),
        textures = engine_config.textures.len(),
        "resolved shadercam run"
    );

    let encoder = CliEncoder::from_config(&config.recording);
    let output = match config.record_window() {
        Some(_) => Some(resolve_output(&config, args.output, encoder.file_extension())?),
        None => None,
    };

    let backend = WgpuBackend::offscreen().with_options(GpuOptions {
        force_fallback_adapter: args.fallback_adapter,
        ..GpuOptions::default()
    });
    let mut engine = RenderEngine::new(
        engine_config,
        backend,
        encoder,
        CliBinder::from_config(&config.binder),
    );
    let events = engine.listen();
    engine.start().context("failed to start render engine")?;
    wait_for_ready(&events)?;

    let camera = SyntheticCamera::new(&config.camera);
    let producer = engine.frame_producer();
    let window = config.record_window();
    let started = Instant::now();
    tracing::info!(
        frames = config.camera.frames,
        interval = ?camera.interval(),
        record = ?window,
        "streaming synthetic camera"
    );

    for index in 0..config.camera.frames {
        if let (Some((from, _)), Some(output)) = (window, output.as_ref()) {
            if index == from {
                engine
                    .start_recording(output)
                    .with_context(|| format!("failed to start recording to {}", output.display()))?;
            }
        }
        if window.is_some_and(|(_, until)| index == until) {
            report_stop(&engine)?;
        }

        producer
            .push(camera.frame(index))
            .context("camera frame rejected")?;
        drain_events(&events)?;

        if !args.unpaced {
            let deadline = started + camera.interval() * (index + 1);
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
        }
    }
    if engine.is_recording() {
        report_stop(&engine)?;
    }

    engine.request_shutdown();
    let reason = wait_for_finish(&events)?;
    engine.join().context("render thread did not exit cleanly")?;

    let stats = engine.stats();
    println!(
        "Rendered {} frames ({} dropped, {} recorded, {} blit fallbacks); engine finished: {reason:?}",
        stats.frames_rendered, stats.frames_dropped, stats.frames_recorded, stats.blit_fallbacks
    );
    if reason != FinishReason::Requested {
        bail!("render engine stopped unexpectedly: {reason:?}");
    }
    Ok(())
}

pub fn check(args: CheckArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let config = load_config(&args.shaders, &paths)?;
    let shaders = resolve_shaders(&config, &args.shaders, &paths);
    let textures = build_textures(&config, &args.shaders)?;
    textures.load().context("failed to load textures")?;

    let read = |path: &Path| {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read shader {}", path.display()))
    };
    let vertex = read(&shaders.vertex)?;
    let fragment = read(&shaders.fragment)?;
    let program = ShaderProgramCompiler::with_slots(textures.slots())
        .compile(&vertex, &fragment)
        .context("shader program is invalid")?;

    println!(
        "{} + {} compiled",
        shaders.vertex.display(),
        shaders.fragment.display()
    );
    println!("Uniforms:");
    for (name, location) in program.uniforms() {
        println!(
            "  {name:<24} set={} binding={} offset={:<4} {:?}",
            location.group, location.binding, location.offset, location.kind
        );
    }
    match program.params_layout() {
        Some(layout) => println!(
            "Parameter block {} ({} bytes, {} members)",
            layout.name.as_deref().unwrap_or("<anonymous>"),
            layout.size,
            layout.members.len()
        ),
        None => println!("No custom parameter block"),
    }
    for slot in program.texture_slots() {
        println!("Texture slot {} -> {}", slot.index, slot.uniform_name);
    }
    Ok(())
}

fn load_config(args: &ShaderArgs, paths: &AppPaths) -> Result<CamConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let default = paths.config_file();
            if !default.exists() {
                tracing::debug!(path = %default.display(), "no config file; using defaults");
                return Ok(CamConfig::default());
            }
            default
        }
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    CamConfig::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn apply_run_overrides(config: &mut CamConfig, args: &RunArgs) {
    if let Some(frames) = args.frames {
        config.camera.frames = frames;
    }
    if let Some(from) = args.record_from {
        config.camera.record_from = Some(from);
        config.camera.record_until = args.record_until;
    }
    if let Some((width, height)) = args.camera_size {
        config.camera.width = width;
        config.camera.height = height;
    }
    if let Some((width, height)) = args.preview_size {
        config.preview.width = width;
        config.preview.height = height;
    }
    if let Some(copy) = args.copy {
        config.preview.copy = match copy {
            CopyArg::Redraw => CopyMode::Redraw,
            CopyArg::Blit => CopyMode::Blit,
        };
    }
    if let Some(encoder) = args.encoder {
        config.recording.encoder = match encoder {
            EncoderArg::Mp4 => EncoderKind::Mp4,
            EncoderArg::Y4m => EncoderKind::Y4m,
        };
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.recording.ffmpeg = Some(ffmpeg.clone());
    }
    if let Some(binder) = args.binder {
        config.binder.kind = match binder {
            BinderArg::Passthrough => BinderKind::Passthrough,
            BinderArg::TouchColor => BinderKind::TouchColor,
            BinderArg::TileTime => BinderKind::TileTime,
        };
    }
}

fn resolve_shaders(config: &CamConfig, args: &ShaderArgs, paths: &AppPaths) -> ShaderPaths {
    if let (Some(vertex), Some(fragment)) = (&args.vertex, &args.fragment) {
        return ShaderPaths::new(vertex, fragment);
    }
    let explicit_dir = args.shader_dir.is_some() || args.purpose.is_some();
    if !explicit_dir {
        if let (Some(vertex), Some(fragment)) = (&config.shaders.vertex, &config.shaders.fragment)
        {
            return ShaderPaths::new(vertex, fragment);
        }
    }
    let dir = args
        .shader_dir
        .clone()
        .or_else(|| config.shaders.dir.clone())
        .unwrap_or_else(|| paths.config_dir().join("shaders"));
    let purpose = args
        .purpose
        .as_deref()
        .or(config.shaders.purpose.as_deref())
        .unwrap_or(DEFAULT_SHADER_PURPOSE);
    ShaderPaths::for_purpose(&dir, purpose)
}

fn build_textures(config: &CamConfig, args: &ShaderArgs) -> Result<TextureBindings> {
    let mut bindings = TextureBindings::new();
    let configured = config
        .textures
        .iter()
        .map(|entry| (entry.name.as_str(), entry.path.as_path()));
    let flagged = args
        .textures
        .iter()
        .map(|(name, path)| (name.as_str(), path.as_path()));
    for (name, path) in configured.chain(flagged) {
        let index = bindings
            .add(name, TextureSource::Path(path.to_path_buf()))
            .with_context(|| format!("cannot bind texture '{name}'"))?;
        tracing::debug!(slot = index, name, path = %path.display(), "texture registered");
    }
    Ok(bindings)
}

fn build_engine_config(
    config: &CamConfig,
    args: &ShaderArgs,
    paths: &AppPaths,
) -> Result<EngineConfig> {
    let mut engine = EngineConfig::new(
        resolve_shaders(config, args, paths),
        (config.preview.width, config.preview.height),
    );
    let recording = &config.recording;
    engine.recording = EncoderSettings {
        width: recording.width,
        height: recording.height,
        video_bit_rate: recording.video_bit_rate,
        frame_rate: recording.frame_rate,
        audio_bit_rate: recording.audio_bit_rate,
        orientation_hint: recording.orientation_hint,
    };
    engine.cache_dir = paths.recording_cache_dir();
    engine.copy_strategy = match config.preview.copy {
        CopyMode::Redraw => CopyStrategy::Redraw,
        CopyMode::Blit => CopyStrategy::Blit,
    };
    engine.clear_color = config.preview.clear_color;
    engine.textures = build_textures(config, args)?;
    Ok(engine)
}

/// Explicit outputs must carry the encoder's extension; a bare name gets it appended.
fn resolve_output(
    config: &CamConfig,
    explicit: Option<PathBuf>,
    extension: &str,
) -> Result<PathBuf> {
    if let Some(mut path) = explicit {
        match path.extension().and_then(|ext| ext.to_str()) {
            None => {
                path.set_extension(extension);
            }
            Some(ext) if ext.eq_ignore_ascii_case(extension) => {}
            Some(ext) => bail!(
                "output {} has extension '{ext}' but the {:?} encoder writes '.{extension}' files",
                path.display(),
                config.recording.encoder
            ),
        }
        return Ok(path);
    }
    let dir = match &config.recording.output_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    Ok(timestamped_output(&dir, extension))
}

fn report_stop(engine: &RenderEngine) -> Result<()> {
    match engine.stop_recording().context("failed to stop recording")? {
        Some(outcome) => println!(
            "Recorded {} frames ({} bytes, {:.1}s) to {}",
            outcome.frames,
            outcome.bytes,
            outcome.duration.as_secs_f32(),
            outcome.path.display()
        ),
        None => tracing::warn!("recording was not active when the stop frame arrived"),
    }
    Ok(())
}

fn wait_for_ready(events: &Receiver<EngineEvent>) -> Result<()> {
    loop {
        match events.recv_timeout(READY_TIMEOUT) {
            Ok(EngineEvent::Ready) => return Ok(()),
            Ok(EngineEvent::InitFailed(message)) => {
                bail!("render engine failed to initialise: {message}")
            }
            Ok(EngineEvent::RecordingFailed(message)) => {
                tracing::warn!(%message, "recording unavailable")
            }
            Ok(EngineEvent::Finished(reason)) => bail!("render engine finished early: {reason:?}"),
            Err(_) => return Err(anyhow!("render engine did not become ready in time")),
        }
    }
}

fn drain_events(events: &Receiver<EngineEvent>) -> Result<()> {
    for event in events.try_iter() {
        match event {
            EngineEvent::RecordingFailed(message) => {
                tracing::warn!(%message, "recording failed")
            }
            EngineEvent::Finished(reason) => bail!("render engine stopped early: {reason:?}"),
            other => tracing::debug!(?other, "engine event"),
        }
    }
    Ok(())
}

fn wait_for_finish(events: &Receiver<EngineEvent>) -> Result<FinishReason> {
    loop {
        match events.recv_timeout(FINISH_TIMEOUT) {
            Ok(EngineEvent::Finished(reason)) => return Ok(reason),
            Ok(EngineEvent::RecordingFailed(message)) => {
                tracing::warn!(%message, "recording failed during shutdown")
            }
            Ok(other) => tracing::debug!(?other, "engine event"),
            Err(_) => return Err(anyhow!("render engine did not finish in time")),
        }
    }
}

/// Encoder chosen from configuration.
enum CliEncoder {
    Mp4(FfmpegEncoder),
    Y4m(Y4mEncoder),
}

impl CliEncoder {
    fn from_config(section: &RecordingSection) -> Self {
        match section.encoder {
            EncoderKind::Mp4 => Self::Mp4(match &section.ffmpeg {
                Some(program) => FfmpegEncoder::with_program(program),
                None => FfmpegEncoder::new(),
            }),
            EncoderKind::Y4m => Self::Y4m(Y4mEncoder::new()),
        }
    }

    fn inner(&mut self) -> &mut dyn Encoder {
        match self {
            Self::Mp4(encoder) => encoder,
            Self::Y4m(encoder) => encoder,
        }
    }
}

impl Encoder for CliEncoder {
    fn file_extension(&self) -> &str {
        match self {
            Self::Mp4(encoder) => encoder.file_extension(),
            Self::Y4m(encoder) => encoder.file_extension(),
        }
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError> {
        self.inner().prepare(settings, output)
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        self.inner().start()
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.inner().stop()
    }

    fn release(&mut self) {
        self.inner().release()
    }
}

/// Binder chosen from configuration.
enum CliBinder {
    Passthrough(PassthroughBinder),
    TouchColor(TouchColorBinder),
    TileTime(TileTimeBinder),
}

impl CliBinder {
    fn from_config(section: &BinderSection) -> Self {
        match section.kind {
            BinderKind::Passthrough => Self::Passthrough(PassthroughBinder),
            BinderKind::TouchColor => {
                let touch = TouchPoint::new();
                if let Some([x, y]) = section.touch {
                    touch.set(x, y);
                }
                Self::TouchColor(TouchColorBinder::new(touch))
            }
            BinderKind::TileTime => Self::TileTime(TileTimeBinder::new(
                section.tiles.unwrap_or(TileTimeBinder::DEFAULT_TILES),
            )),
        }
    }
}

impl ShaderParameterBinder for CliBinder {
    fn bind(&mut self, uniforms: &mut UniformWriter<'_>, frame: &FrameInfo) {
        match self {
            Self::Passthrough(binder) => binder.bind(uniforms, frame),
            Self::TouchColor(binder) => binder.bind(uniforms, frame),
            Self::TileTime(binder) => binder.bind(uniforms, frame),
        }
    }
}
