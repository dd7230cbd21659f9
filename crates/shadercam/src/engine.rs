//! Owner-facing handle to the render thread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::backend::RenderBackend;
use crate::binder::ShaderParameterBinder;
use crate::frame_source::FrameProducer;
use crate::recording::{Encoder, RecordingError, RecordingOutcome};
use crate::types::{EngineConfig, ShaderSources, TextureError};
use crate::worker::{self, Command, WorkerParts};

/// Capacity of the render thread's command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

const RENDER_THREAD_NAME: &str = "shadercam-render";

/// Lifecycle of a [`RenderEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

/// Recording session phase shared between the owner and the render thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingPhase {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// `request_shutdown` was called or the engine was dropped.
    Requested,
    InitFailed,
    /// A surface became unusable while rendering.
    SurfaceLost,
}

/// Notifications delivered to the registered listener, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    Ready,
    InitFailed(String),
    RecordingFailed(String),
    Finished(FinishReason),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine has already been started")]
    AlreadyStarted,
    #[error("an event listener must be set before start")]
    ListenerNotSet,
    #[error("recording output path is empty")]
    NoOutputPath,
    #[error("engine is not running")]
    NotRunning,
    #[error("engine has terminated")]
    Terminated,
    #[error("failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    TextureLoad(#[from] TextureError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("render thread panicked")]
    RenderThreadPanicked,
}

/// Counters maintained by the render thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_rendered: u64,
    pub frames_recorded: u64,
    /// Camera images replaced before the render thread pulled them.
    pub frames_dropped: u64,
    /// Blits that failed and were redrawn instead.
    pub blit_fallbacks: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub rendered: AtomicU64,
    pub recorded: AtomicU64,
    pub blit_fallbacks: AtomicU64,
}

/// State read by the owner and written by the render thread.
pub(crate) struct Shared {
    state: Mutex<EngineState>,
    phase: Mutex<RecordingPhase>,
    viewport_size: Mutex<Option<(u32, u32)>>,
    /// Session finalized by teardown, handed to a `stop_recording` that lost the race.
    finalized: Mutex<Option<RecordingOutcome>>,
    shutdown: AtomicBool,
    pub stats: StatCounters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Created),
            phase: Mutex::new(RecordingPhase::Idle),
            viewport_size: Mutex::new(None),
            finalized: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: EngineState) {
        let mut current = lock(&self.state);
        tracing::debug!(from = ?*current, to = ?state, "engine state");
        *current = state;
    }

    pub fn phase(&self) -> RecordingPhase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: RecordingPhase) {
        *lock(&self.phase) = phase;
    }

    pub fn viewport_size(&self) -> Option<(u32, u32)> {
        *lock(&self.viewport_size)
    }

    pub fn store_finalized(&self, outcome: RecordingOutcome) {
        *lock(&self.finalized) = Some(outcome);
    }

    fn take_finalized(&self) -> Option<RecordingOutcome> {
        lock(&self.finalized).take()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct Collaborators {
    backend: Box<dyn RenderBackend>,
    encoder: Box<dyn Encoder>,
    binder: Box<dyn ShaderParameterBinder>,
}

/// Camera-to-shader-to-encoder pipeline running on its own thread.
///
/// All GPU work happens on the render thread spawned by [`start`]. The
/// owner talks to it through a bounded command queue and hears back through
/// the [`EngineEvent`] listener.
///
/// [`start`]: RenderEngine::start
pub struct RenderEngine {
    config: EngineConfig,
    collaborators: Mutex<Option<Collaborators>>,
    listener: Option<Sender<EngineEvent>>,
    producer: FrameProducer,
    shared: Arc<Shared>,
    commands: Sender<Command>,
    command_rx: Option<Receiver<Command>>,
    /// Disconnects once the render thread has exited.
    finished: Receiver<()>,
    finished_tx: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl RenderEngine {
    pub fn new(
        config: EngineConfig,
        backend: impl RenderBackend,
        encoder: impl Encoder + 'static,
        binder: impl ShaderParameterBinder + 'static,
    ) -> Self {
        let (commands, command_rx) = bounded(COMMAND_QUEUE_CAPACITY);
        let (finished_tx, finished) = bounded(0);
        Self {
            config,
            collaborators: Mutex::new(Some(Collaborators {
                backend: Box::new(backend),
                encoder: Box::new(encoder),
                binder: Box::new(binder),
            })),
            listener: None,
            producer: FrameProducer::new(),
            shared: Arc::new(Shared::new()),
            commands,
            command_rx: Some(command_rx),
            finished,
            finished_tx: Some(finished_tx),
            join_handle: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Routes engine events to `listener`. Replaces any previous listener until `start`.
    pub fn set_listener(&mut self, listener: Sender<EngineEvent>) {
        self.listener = Some(listener);
    }

    /// Creates an event channel, registers its sender and returns the receiver.
    pub fn listen(&mut self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.set_listener(tx);
        rx
    }

    /// Handle the camera pushes images through. Usable before and after `start`.
    pub fn frame_producer(&self) -> FrameProducer {
        self.producer.clone()
    }

    /// Loads shaders and textures, then spawns the render thread.
    ///
    /// Initialization continues asynchronously; watch for [`EngineEvent::Ready`]
    /// or [`EngineEvent::InitFailed`].
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.join_handle.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        if self.shared.shutdown_requested() || self.shared.state() == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        let events = self.listener.clone().ok_or(EngineError::ListenerNotSet)?;
        let sources = load_sources(&self.config)?;
        let textures = self.config.textures.load()?;
        let collaborators = match self.collaborators.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let (Some(collaborators), Some(command_rx), Some(finished)) =
            (collaborators, self.command_rx.take(), self.finished_tx.take())
        else {
            return Err(EngineError::AlreadyStarted);
        };

        let parts = WorkerParts {
            config: self.config.clone(),
            sources,
            textures,
            backend: collaborators.backend,
            encoder: collaborators.encoder,
            binder: collaborators.binder,
            producer: self.producer.clone(),
            shared: self.shared.clone(),
            commands: self.commands.clone(),
            command_rx,
            events,
            finished,
        };

        self.shared.set_state(EngineState::Initializing);
        let handle = thread::Builder::new()
            .name(RENDER_THREAD_NAME.into())
            .spawn(move || worker::run(parts))
            .map_err(|err| {
                self.shared.set_state(EngineState::Terminated);
                EngineError::Spawn(err)
            })?;
        self.join_handle = Some(handle);
        tracing::debug!(
            vertex = %self.config.shaders.vertex.display(),
            fragment = %self.config.shaders.fragment.display(),
            "render thread spawned"
        );
        Ok(())
    }

    /// Asks the render thread to finalize any recording and tear down. Idempotent.
    ///
    /// Completion is reported through [`EngineEvent::Finished`].
    pub fn request_shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.join_handle.is_none() {
            self.shared.set_state(EngineState::Terminated);
            return;
        }
        // The worker checks the flag between commands, so a full queue still shuts down.
        let _ = self.commands.try_send(Command::Shutdown);
    }

    /// Starts recording into `output`. Blocks until the render thread has started the encoder.
    pub fn start_recording(&self, output: impl AsRef<Path>) -> Result<(), EngineError> {
        let output = output.as_ref();
        if output.as_os_str().is_empty() {
            return Err(EngineError::NoOutputPath);
        }
        if self.state() != EngineState::Running || self.shared.shutdown_requested() {
            return Err(EngineError::NotRunning);
        }
        {
            let mut phase = lock(&self.shared.phase);
            if *phase != RecordingPhase::Idle {
                return Err(RecordingError::AlreadyRecording.into());
            }
            *phase = RecordingPhase::Starting;
        }

        let (reply, answer) = bounded(1);
        let sent = self.commands.send(Command::StartRecording {
            output: output.to_path_buf(),
            reply,
        });
        let result = match sent {
            Ok(()) => self.await_reply(&answer).ok_or(EngineError::NotRunning),
            Err(_) => Err(EngineError::NotRunning),
        };
        match result {
            Ok(started) => started.map_err(EngineError::from),
            Err(err) => {
                self.shared.set_phase(RecordingPhase::Idle);
                Err(err)
            }
        }
    }

    /// Stops the active recording and returns the finalized file, or `None` when idle.
    ///
    /// A session that shutdown already finalized is returned by the first call after it.
    pub fn stop_recording(&self) -> Result<Option<RecordingOutcome>, EngineError> {
        {
            let mut phase = lock(&self.shared.phase);
            if *phase != RecordingPhase::Active {
                return Ok(self.shared.take_finalized());
            }
            *phase = RecordingPhase::Stopping;
        }

        let (reply, answer) = bounded(1);
        let answered = match self.commands.send(Command::StopRecording { reply }) {
            Ok(()) => self.await_reply(&answer),
            Err(_) => None,
        };
        match answered {
            Some(outcome) => outcome.map_err(EngineError::from),
            None => {
                self.shared.set_phase(RecordingPhase::Idle);
                Ok(self.shared.take_finalized())
            }
        }
    }

    /// Waits for the render thread's answer, or `None` once the thread has exited without one.
    fn await_reply<T>(&self, answer: &Receiver<T>) -> Option<T> {
        select! {
            recv(answer) -> reply => reply.ok(),
            recv(self.finished) -> _ => answer.try_recv().ok(),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(
            self.shared.phase(),
            RecordingPhase::Active | RecordingPhase::Stopping
        )
    }

    pub fn recording_phase(&self) -> RecordingPhase {
        self.shared.phase()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.stats;
        EngineStats {
            frames_rendered: counters.rendered.load(Ordering::Relaxed),
            frames_recorded: counters.recorded.load(Ordering::Relaxed),
            frames_dropped: self.producer.frames_replaced(),
            blit_fallbacks: counters.blit_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Records the on-screen size of the preview, used to letterbox the camera image.
    pub fn update_viewport(&self, width: u32, height: u32) {
        *lock(&self.shared.viewport_size) = Some((width, height));
    }

    /// Waits for the render thread to exit. Does not request shutdown by itself.
    pub fn join(&mut self) -> Result<(), EngineError> {
        match self.join_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::RenderThreadPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        self.request_shutdown();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

fn load_sources(config: &EngineConfig) -> Result<ShaderSources, EngineError> {
    let read = |path: &Path| {
        fs::read_to_string(path).map_err(|source| EngineError::ShaderLoad {
            path: path.to_path_buf(),
            source,
        })
    };
    Ok(ShaderSources {
        vertex: read(&config.shaders.vertex)?,
        fragment: read(&config.shaders.fragment)?,
    })
}
