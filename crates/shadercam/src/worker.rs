//! Render-thread side of the engine: initialization, the command loop and teardown.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::backend::{
    BackendError, ContextRequest, DrawCall, ProgramHandle, RenderBackend, SurfaceError,
};
use crate::binder::{FrameInfo, ShaderParameterBinder};
use crate::compile::{ShaderError, ShaderProgramCompiler};
use crate::context::{DrawSurface, RenderContext};
use crate::engine::{EngineEvent, EngineState, FinishReason, RecordingPhase, Shared};
use crate::frame_source::{FrameProducer, FrameSource, FrameSourceError, FrameStamp};
use crate::geometry::GeometryBuffers;
use crate::recording::{Encoder, RecordingController, RecordingError, RecordingOutcome};
use crate::types::{CopyStrategy, EngineConfig, LoadedTexture, ShaderSources};
use crate::uniforms::{CameraUniforms, ParamsBlock};
use crate::viewport::fit_viewport;

pub(crate) enum Command {
    FrameAvailable,
    StartRecording {
        output: PathBuf,
        reply: Sender<Result<(), RecordingError>>,
    },
    StopRecording {
        reply: Sender<Result<Option<RecordingOutcome>, RecordingError>>,
    },
    Shutdown,
}

/// Everything moved onto the render thread at start.
pub(crate) struct WorkerParts {
    pub config: EngineConfig,
    pub sources: ShaderSources,
    pub textures: Vec<LoadedTexture>,
    pub backend: Box<dyn RenderBackend>,
    pub encoder: Box<dyn Encoder>,
    pub binder: Box<dyn ShaderParameterBinder>,
    pub producer: FrameProducer,
    pub shared: Arc<Shared>,
    pub commands: Sender<Command>,
    pub command_rx: Receiver<Command>,
    pub events: Sender<EngineEvent>,
    /// Dropped when the thread exits so owners blocked on a reply wake up.
    pub finished: Sender<()>,
}

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Frames(#[from] FrameSourceError),
}

/// Render thread entry point.
pub(crate) fn run(parts: WorkerParts) {
    let shared = parts.shared.clone();
    let events = parts.events.clone();
    let send = |event: EngineEvent| {
        if events.send(event).is_err() {
            tracing::debug!("engine listener dropped");
        }
    };

    let request = ContextRequest {
        preview_size: parts.config.preview_size,
        recordable: true,
    };
    let WorkerParts {
        config,
        sources,
        textures,
        backend,
        encoder,
        binder,
        producer,
        shared: _,
        commands,
        command_rx,
        events: worker_events,
        finished,
    } = parts;

    let controller =
        RecordingController::new(encoder, config.recording.clone(), config.cache_dir.clone());
    let mut frames = FrameSource::bind(&producer);

    let context = match RenderContext::create(backend, &request) {
        Ok(context) => context,
        Err(err) => {
            tracing::error!(error = %err, "graphics context creation failed");
            frames.release();
            send(EngineEvent::InitFailed(err.to_string()));
            shared.set_state(EngineState::Terminated);
            send(EngineEvent::Finished(FinishReason::InitFailed));
            drop(finished);
            return;
        }
    };

    let mut worker = Worker {
        context,
        frames,
        controller,
        binder,
        shared: shared.clone(),
        events: worker_events,
        command_rx,
        copy_strategy: config.copy_strategy,
        clear_color: config.clear_color,
        preview: None,
        recording: None,
        program: None,
        params: ParamsBlock::new(None),
        first_timestamp: None,
        frame_index: 0,
    };

    let reason = match worker.initialise(&sources, &textures, commands) {
        Ok(arm_error) => {
            shared.set_state(EngineState::Running);
            tracing::info!("render engine ready");
            send(EngineEvent::Ready);
            if let Some(err) = arm_error {
                send(EngineEvent::RecordingFailed(err.to_string()));
            }
            worker.run_loop()
        }
        Err(err) => {
            tracing::error!(error = %err, "render engine initialization failed");
            send(EngineEvent::InitFailed(err.to_string()));
            FinishReason::InitFailed
        }
    };

    shared.set_state(EngineState::ShuttingDown);
    worker.teardown();
    shared.set_state(EngineState::Terminated);
    tracing::info!(?reason, "render engine finished");
    send(EngineEvent::Finished(reason));
    drop(finished);
}

struct Worker {
    context: RenderContext,
    frames: FrameSource,
    controller: RecordingController,
    binder: Box<dyn ShaderParameterBinder>,
    shared: Arc<Shared>,
    events: Sender<EngineEvent>,
    command_rx: Receiver<Command>,
    copy_strategy: CopyStrategy,
    clear_color: [f32; 4],
    preview: Option<DrawSurface>,
    recording: Option<DrawSurface>,
    program: Option<ProgramHandle>,
    params: ParamsBlock,
    first_timestamp: Option<i64>,
    frame_index: u64,
}

/// Inputs shared by every draw pass of one camera frame.
struct PassInput {
    stamp: FrameStamp,
    transform: [f32; 16],
    elapsed: Duration,
    frame_index: u64,
}

impl Worker {
    fn initialise(
        &mut self,
        sources: &ShaderSources,
        textures: &[LoadedTexture],
        commands: Sender<Command>,
    ) -> Result<Option<RecordingError>, InitError> {
        self.context.upload_geometry(&GeometryBuffers::quad())?;
        let preview = self.context.create_preview_surface()?;
        tracing::debug!(size = ?preview.size(), "preview surface created");
        self.preview = Some(preview);

        let compiler = ShaderProgramCompiler::with_slots(textures.iter().map(|texture| &texture.slot));
        let program = compiler.compile(&sources.vertex, &sources.fragment)?;
        self.params = ParamsBlock::new(program.params_layout());
        self.program = Some(self.context.link_program(&program)?);

        for texture in textures {
            self.context.upload_texture(texture)?;
            tracing::debug!(
                slot = texture.slot.index,
                name = %texture.slot.uniform_name,
                width = texture.image.width(),
                height = texture.image.height(),
                "user texture uploaded"
            );
        }

        let arm_error = self.arm_encoder().err();
        if let Some(err) = &arm_error {
            tracing::warn!(error = %err, "recording unavailable; preview continues");
        }

        self.frames.attach_listener(move || match commands.try_send(Command::FrameAvailable) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => true,
            Err(TrySendError::Full(_)) => false,
        })?;
        Ok(arm_error)
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("engine listener dropped");
        }
    }

    fn run_loop(&mut self) -> FinishReason {
        loop {
            if self.shared.shutdown_requested() {
                return FinishReason::Requested;
            }
            let Ok(command) = self.command_rx.recv() else {
                return FinishReason::Requested;
            };
            match command {
                Command::FrameAvailable => {
                    if let Err(reason) = self.render_frame() {
                        return reason;
                    }
                }
                Command::StartRecording { output, reply } => {
                    let result = self.start_recording(output);
                    let _ = reply.send(result);
                }
                Command::StopRecording { reply } => {
                    let result = self.finish_session(true);
                    self.shared.set_phase(RecordingPhase::Idle);
                    let _ = reply.send(result);
                }
                Command::Shutdown => return FinishReason::Requested,
            }
        }
    }

    /// Prepares the encoder into a fresh temp file and creates the recording surface.
    fn arm_encoder(&mut self) -> Result<(), RecordingError> {
        let temp = self.controller.create_temp_path()?;
        let input = self.controller.begin(&temp)?;
        match self.context.create_recording_surface(&input) {
            Ok(surface) => {
                tracing::debug!(size = ?surface.size(), temp = %temp.display(), "recording surface armed");
                self.recording = Some(surface);
                Ok(())
            }
            Err(err) => {
                self.controller.discard();
                Err(RecordingError::Surface(err.to_string()))
            }
        }
    }

    fn start_recording(&mut self, output: PathBuf) -> Result<(), RecordingError> {
        let started = self.try_start_recording(output);
        let phase = if started.is_ok() {
            RecordingPhase::Active
        } else {
            RecordingPhase::Idle
        };
        self.shared.set_phase(phase);
        started
    }

    fn try_start_recording(&mut self, output: PathBuf) -> Result<(), RecordingError> {
        if self.recording.is_none() || !self.controller.is_prepared() {
            self.arm_encoder()?;
        }
        self.controller.start(output)?;
        Ok(())
    }

    /// Ends the active session: recording surface first, then the encoder, then the file move.
    ///
    /// Leaves the shared phase to the caller.
    fn finish_session(&mut self, rearm: bool) -> Result<Option<RecordingOutcome>, RecordingError> {
        if !self.controller.is_active() {
            return Ok(None);
        }
        if let Some(surface) = self.recording.take() {
            surface.release(&mut self.context);
        }
        let outcome = self.controller.end();

        if rearm {
            if let Err(err) = self.arm_encoder() {
                tracing::warn!(error = %err, "failed to re-arm encoder");
            }
        }
        outcome.map(Some)
    }

    /// Ends the session after the encoder rejected a frame.
    fn abort_session(&mut self, reason: String) {
        tracing::error!(error = %reason, "recording failed; finalizing what was written");
        let finished = self.finish_session(true);
        self.shared.set_phase(RecordingPhase::Idle);
        match finished {
            Ok(Some(outcome)) => tracing::info!(
                output = %outcome.path.display(),
                frames = outcome.frames,
                "partial recording kept"
            ),
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "failed to finalize recording"),
        }
        self.emit(EngineEvent::RecordingFailed(reason));
    }

    fn render_frame(&mut self) -> Result<(), FinishReason> {
        let stamp = match self.frames.pull_latest_image(&mut self.context) {
            Ok(Some(stamp)) => stamp,
            Ok(None) => {
                tracing::trace!("spurious frame notification");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to update camera texture; skipping frame");
                return Ok(());
            }
        };
        let first = *self.first_timestamp.get_or_insert(stamp.timestamp_ns);
        let elapsed = u64::try_from(stamp.timestamp_ns - first).unwrap_or(0);
        let input = PassInput {
            stamp,
            transform: self.frames.latest_transform(),
            elapsed: Duration::from_nanos(elapsed),
            frame_index: self.frame_index,
        };
        self.frame_index += 1;

        let Some(preview) = self.preview.take() else {
            return Err(FinishReason::SurfaceLost);
        };
        let result = self.render_with_preview(&preview, &input);
        self.preview = Some(preview);
        result
    }

    fn render_with_preview(&mut self, preview: &DrawSurface, input: &PassInput) -> Result<(), FinishReason> {
        if let Err(err) = self.draw_pass(preview, input) {
            return self.surface_failure(err, "preview draw");
        }

        if self.controller.is_active() {
            self.record_frame(preview, input)?;
        }

        match preview.swap_buffers(&mut self.context) {
            Ok(()) => {
                self.shared.stats.rendered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => self.surface_failure(err, "preview present"),
        }
    }

    fn record_frame(&mut self, preview: &DrawSurface, input: &PassInput) -> Result<(), FinishReason> {
        let Some(target) = self.recording.take() else {
            return Ok(());
        };
        let copied = self.copy_to_recording(preview, &target, input);
        let presented = copied.and_then(|()| {
            target.set_presentation_time(&mut self.context, input.stamp.timestamp_ns);
            target.swap_buffers(&mut self.context)
        });
        self.recording = Some(target);

        match presented {
            Ok(()) => {
                self.controller.record_frame();
                self.shared.stats.recorded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SurfaceError::Encoder(err)) => {
                self.abort_session(err.to_string());
                Ok(())
            }
            Err(err) if err.is_fatal() => self.surface_failure(err, "recording present"),
            Err(err) => {
                tracing::warn!(error = %err, "recording frame skipped");
                Ok(())
            }
        }
    }

    fn copy_to_recording(
        &mut self,
        preview: &DrawSurface,
        target: &DrawSurface,
        input: &PassInput,
    ) -> Result<(), SurfaceError> {
        let blit = self.copy_strategy == CopyStrategy::Blit
            && self.context.capabilities().framebuffer_blit
            && preview.size() == target.size();
        if blit {
            match self.context.blit(preview, target) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.shared.stats.blit_fallbacks.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %err, "blit failed; redrawing into recording surface");
                }
            }
        }
        self.draw_pass(target, input)
    }

    /// Clears `surface` and draws the quad through the program with fresh uniforms.
    fn draw_pass(&mut self, surface: &DrawSurface, input: &PassInput) -> Result<(), SurfaceError> {
        let Some(program) = self.program else {
            return Err(SurfaceError::Unsupported("no program linked".into()));
        };
        surface.make_current(&mut self.context)?;

        let size = surface.size();
        let letterbox_area = if surface.is_recording_target() {
            size
        } else {
            self.shared.viewport_size().unwrap_or(size)
        };
        let viewport = fit_viewport(input.stamp.size, letterbox_area).clamp_to(size);

        let info = FrameInfo {
            frame_index: input.frame_index,
            timestamp_ns: input.stamp.timestamp_ns,
            elapsed: input.elapsed,
            surface_size: size,
            viewport,
            target: surface.kind(),
        };
        self.binder.bind(&mut self.params.writer(), &info);

        let camera = CameraUniforms::new(input.transform, viewport);
        self.context.draw(&DrawCall {
            program,
            viewport,
            clear_color: self.clear_color,
            camera: &camera,
            params: self.params.bytes(),
        })
    }

    fn surface_failure(&mut self, err: SurfaceError, pass: &str) -> Result<(), FinishReason> {
        if err.is_fatal() {
            tracing::error!(error = %err, pass, "surface unusable; shutting down");
            return Err(FinishReason::SurfaceLost);
        }
        tracing::warn!(error = %err, pass, "frame skipped");
        Ok(())
    }

    /// Finalizes any session, then releases recording surface, preview surface, encoder and context.
    ///
    /// Commands still queued are dropped, so their senders see a closed reply channel.
    fn teardown(mut self) {
        if self.controller.is_active() {
            match self.finish_session(false) {
                Ok(Some(outcome)) => {
                    tracing::info!(
                        output = %outcome.path.display(),
                        bytes = outcome.bytes,
                        "recording finalized during shutdown"
                    );
                    self.shared.store_finalized(outcome);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "failed to finalize recording during shutdown");
                    self.emit(EngineEvent::RecordingFailed(err.to_string()));
                }
            }
        }
        self.shared.set_phase(RecordingPhase::Idle);

        if let Some(surface) = self.recording.take() {
            surface.release(&mut self.context);
        }
        if let Some(surface) = self.preview.take() {
            surface.release(&mut self.context);
        }
        self.controller.discard();
        self.frames.release();
        if let Some(program) = self.program.take() {
            self.context.delete_program(program);
        }
        self.context.release();

        let pending = self.command_rx.try_iter().count();
        if pending > 0 {
            tracing::debug!(pending, "dropped commands queued behind shutdown");
        }
    }
}
