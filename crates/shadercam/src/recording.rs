//! Encoder seam and the recording session lifecycle.
//!
//! An [`Encoder`] is armed into a `temp_mov*` file in the cache directory.
//! [`RecordingController`] starts it and stops it in step with the engine,
//! then copies the finished file to the path the owner asked for.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Video width handed to the encoder.
pub const VIDEO_WIDTH: u32 = 720;
/// Video height handed to the encoder.
pub const VIDEO_HEIGHT: u32 = 1280;
pub const VIDEO_BIT_RATE: u32 = 10_000_000;
pub const VIDEO_FRAME_RATE: u32 = 30;
pub const AUDIO_BIT_RATE: u32 = 44_800;

const TEMP_PREFIX: &str = "temp_mov";

/// Fixed output parameters an encoder is prepared with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub video_bit_rate: u32,
    pub frame_rate: u32,
    pub audio_bit_rate: u32,
    pub orientation_hint: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: VIDEO_WIDTH,
            height: VIDEO_HEIGHT,
            video_bit_rate: VIDEO_BIT_RATE,
            frame_rate: VIDEO_FRAME_RATE,
            audio_bit_rate: AUDIO_BIT_RATE,
            orientation_hint: 0,
        }
    }
}

/// One rendered frame read back from the recording surface, tightly packed RGBA8.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
    pub presentation_time_ns: i64,
}

/// Consumer of rendered frames; this is the encoder's drawable input.
pub trait FrameSink: Send + Sync {
    fn submit(&self, frame: &VideoFrame<'_>) -> io::Result<()>;
}

/// Surface description an encoder exposes once prepared.
#[derive(Clone)]
pub struct EncoderInput {
    pub width: u32,
    pub height: u32,
    pub sink: Arc<dyn FrameSink>,
}

impl std::fmt::Debug for EncoderInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderInput")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("encoder rejected settings: {0}")]
    InvalidSettings(String),
    #[error("encoder is not prepared")]
    NotPrepared,
    #[error("encoder process failed: {0}")]
    Process(String),
}

/// Opaque video encoder collaborator.
///
/// An encoder is prepared against a file, started, stopped and released once
/// per session, and may be prepared again afterwards.
pub trait Encoder: Send {
    /// Extension (without the dot) of the files this encoder writes.
    fn file_extension(&self) -> &str {
        "mp4"
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError>;

    fn start(&mut self) -> Result<(), EncoderError>;

    fn stop(&mut self) -> Result<(), EncoderError>;

    fn release(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("a recording session is already active")]
    AlreadyRecording,
    #[error("no recording session is active")]
    NotRecording,
    #[error("recording encoder is not available: {0}")]
    EncoderUnavailable(String),
    #[error("failed to start recording: {0}")]
    StartFailed(#[source] EncoderError),
    #[error("failed to stop recording: {0}")]
    StopFailed(#[source] EncoderError),
    #[error("failed to create temporary recording file in {dir}: {source}")]
    TempFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to copy recording from {temp} to {output}: {source}")]
    Io {
        temp: PathBuf,
        output: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("recording surface failed: {0}")]
    Surface(String),
}

/// The active recording: frames go to `temp_path` until the session ends.
#[derive(Clone, Debug)]
pub struct RecordingSession {
    pub temp_path: PathBuf,
    pub output_path: PathBuf,
    pub started: Instant,
    pub frames: u64,
}

/// Result of a finalized recording.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub frames: u64,
    pub duration: Duration,
}

/// Drives an [`Encoder`] through its lifecycle and moves finished files into place.
///
/// Lives on the render thread; the engine pairs each prepared encoder input
/// with a recording surface.
pub struct RecordingController {
    encoder: Box<dyn Encoder>,
    settings: EncoderSettings,
    cache_dir: PathBuf,
    prepared: Option<PathBuf>,
    session: Option<RecordingSession>,
}

impl RecordingController {
    pub fn new(encoder: Box<dyn Encoder>, settings: EncoderSettings, cache_dir: PathBuf) -> Self {
        Self {
            encoder,
            settings,
            cache_dir,
            prepared: None,
            session: None,
        }
    }

    /// Reserves a fresh temp file in the cache directory.
    pub fn create_temp_path(&self) -> Result<PathBuf, RecordingError> {
        let suffix = format!(".{}", self.encoder.file_extension());
        let temp_error = |source| RecordingError::TempFile {
            dir: self.cache_dir.clone(),
            source,
        };
        fs::create_dir_all(&self.cache_dir).map_err(temp_error)?;
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&suffix)
            .tempfile_in(&self.cache_dir)
            .map_err(temp_error)?;
        let (_, path) = file.keep().map_err(|err| temp_error(err.error))?;
        Ok(path)
    }

    /// Prepares the encoder to write into `temp_path` and returns its input surface.
    pub fn begin(&mut self, temp_path: &Path) -> Result<EncoderInput, RecordingError> {
        if self.session.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }
        let input = match self.encoder.prepare(&self.settings, temp_path) {
            Ok(input) => input,
            Err(err) => {
                remove_temp(temp_path);
                return Err(RecordingError::EncoderUnavailable(err.to_string()));
            }
        };
        tracing::debug!(
            temp = %temp_path.display(),
            width = input.width,
            height = input.height,
            bitrate = self.settings.video_bit_rate,
            fps = self.settings.frame_rate,
            "encoder prepared"
        );
        self.prepared = Some(temp_path.to_path_buf());
        Ok(input)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Starts the prepared encoder and opens a session targeting `output`.
    pub fn start(&mut self, output: PathBuf) -> Result<&RecordingSession, RecordingError> {
        if self.session.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }
        let temp_path = self
            .prepared
            .clone()
            .ok_or_else(|| RecordingError::EncoderUnavailable("encoder is not prepared".into()))?;
        self.encoder.start().map_err(RecordingError::StartFailed)?;
        tracing::info!(output = %output.display(), temp = %temp_path.display(), "recording started");
        Ok(&*self.session.insert(RecordingSession {
            temp_path,
            output_path: output,
            started: Instant::now(),
            frames: 0,
        }))
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn record_frame(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.frames += 1;
        }
    }

    /// Stops and releases the encoder, then moves the temp file to the session's output path.
    ///
    /// On failure the temp file is left in place.
    pub fn end(&mut self) -> Result<RecordingOutcome, RecordingError> {
        let session = self.session.take().ok_or(RecordingError::NotRecording)?;
        self.prepared = None;

        let stopped = self.encoder.stop();
        self.encoder.release();
        if let Err(err) = stopped {
            tracing::warn!(
                temp = %session.temp_path.display(),
                error = %err,
                "encoder failed to stop; keeping temp file"
            );
            return Err(RecordingError::StopFailed(err));
        }

        let bytes = finalize_recording(&session.temp_path, &session.output_path)?;
        let outcome = RecordingOutcome {
            path: session.output_path,
            bytes,
            frames: session.frames,
            duration: session.started.elapsed(),
        };
        tracing::info!(
            output = %outcome.path.display(),
            bytes = outcome.bytes,
            frames = outcome.frames,
            "recording finalized"
        );
        Ok(outcome)
    }

    /// Releases a prepared encoder that never started and removes its unused temp file.
    pub fn discard(&mut self) {
        if self.session.is_some() {
            return;
        }
        if let Some(temp) = self.prepared.take() {
            self.encoder.release();
            remove_temp(&temp);
        }
    }
}

fn remove_temp(temp: &Path) {
    if let Err(err) = fs::remove_file(temp) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(temp = %temp.display(), error = %err, "failed to remove unused temp file");
        }
    }
}

/// Byte-copies `temp` to `output` and deletes `temp`. Returns the number of bytes copied.
///
/// When the copy fails `temp` is left untouched for diagnostics.
pub fn finalize_recording(temp: &Path, output: &Path) -> Result<u64, RecordingError> {
    let bytes = fs::copy(temp, output).map_err(|source| RecordingError::Io {
        temp: temp.to_path_buf(),
        output: output.to_path_buf(),
        source,
    })?;
    if let Err(err) = fs::remove_file(temp) {
        tracing::warn!(temp = %temp.display(), error = %err, "failed to remove temp recording");
    }
    Ok(bytes)
}
