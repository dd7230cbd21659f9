//! MP4 encoder that streams raw RGBA frames into an `ffmpeg` child process.
//!
//! `ffmpeg` must be on `PATH` (or named explicitly). Frames are placed on the
//! same constant-rate timeline as the Y4M writer before they are piped, so
//! the movie duration tracks camera time.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::recording::{
    Encoder, EncoderError, EncoderInput, EncoderSettings, FrameSink, VideoFrame,
};
use crate::timeline::{FrameTimeline, Placement};

const DEFAULT_PROGRAM: &str = "ffmpeg";

/// H.264 in MP4 through the system `ffmpeg`.
pub struct FfmpegEncoder {
    program: OsString,
    child: Option<Child>,
    pipe: Option<Arc<FfmpegPipe>>,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            child: None,
            pipe: None,
        }
    }

    fn arguments(settings: &EncoderSettings, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push("-s".into());
        args.push(format!("{}x{}", settings.width, settings.height).into());
        args.push("-r".into());
        args.push(settings.frame_rate.to_string().into());
        for arg in ["-i", "-", "-an", "-c:v", "libx264", "-pix_fmt", "yuv420p"] {
            args.push(arg.into());
        }
        args.push("-b:v".into());
        args.push(settings.video_bit_rate.to_string().into());
        if settings.orientation_hint != 0 {
            args.push("-metadata:s:v:0".into());
            args.push(format!("rotate={}", settings.orientation_hint).into());
        }
        for arg in ["-movflags", "+faststart", "-f", "mp4"] {
            args.push(arg.into());
        }
        args.push(output.as_os_str().to_os_string());
        args
    }

    fn reap(&mut self) -> Result<(), EncoderError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::Process(format!("ffmpeg exited with {status}")))
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for FfmpegEncoder {
    fn file_extension(&self) -> &str {
        "mp4"
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError> {
        if settings.width == 0 || settings.height == 0 || settings.frame_rate == 0 {
            return Err(EncoderError::InvalidSettings(format!(
                "{}x{} at {} fps cannot be encoded",
                settings.width, settings.height, settings.frame_rate
            )));
        }
        self.release();

        let mut child = Command::new(&self.program)
            .args(Self::arguments(settings, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                EncoderError::Process(format!(
                    "failed to launch {}: {err}",
                    Path::new(&self.program).display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Process("ffmpeg stdin is not piped".into()))?;
        tracing::debug!(
            pid = child.id(),
            output = %output.display(),
            width = settings.width,
            height = settings.height,
            audio_bit_rate = settings.audio_bit_rate,
            "ffmpeg encoder spawned without audio"
        );

        let pipe = Arc::new(FfmpegPipe {
            state: Mutex::new(PipeState {
                stdin: Some(stdin),
                width: settings.width,
                height: settings.height,
                accepting: false,
                timeline: FrameTimeline::new(settings.frame_rate),
                last_frame: Vec::new(),
            }),
        });
        self.child = Some(child);
        self.pipe = Some(pipe.clone());

        Ok(EncoderInput {
            width: settings.width,
            height: settings.height,
            sink: pipe,
        })
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        let pipe = self.pipe.as_ref().ok_or(EncoderError::NotPrepared)?;
        let mut state = pipe.lock();
        if state.stdin.is_none() {
            return Err(EncoderError::NotPrepared);
        }
        state.accepting = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        let pipe = self.pipe.as_ref().ok_or(EncoderError::NotPrepared)?;
        let frames = {
            let mut state = pipe.lock();
            state.accepting = false;
            let mut stdin = state.stdin.take().ok_or(EncoderError::NotPrepared)?;
            stdin.flush()?;
            state.timeline.written()
        };
        self.reap()?;
        tracing::debug!(frames, "ffmpeg finished encoding");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            pipe.lock().stdin = None;
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                tracing::trace!(error = %err, "ffmpeg already exited");
            }
            if let Err(err) = child.wait() {
                tracing::warn!(error = %err, "failed to reap ffmpeg");
            }
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

struct FfmpegPipe {
    state: Mutex<PipeState>,
}

impl FfmpegPipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct PipeState {
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    accepting: bool,
    timeline: FrameTimeline,
    last_frame: Vec<u8>,
}

impl FrameSink for FfmpegPipe {
    fn submit(&self, frame: &VideoFrame<'_>) -> io::Result<()> {
        let mut state = self.lock();
        if !state.accepting {
            return Ok(());
        }
        if frame.width != state.width || frame.height != state.height {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame is {}x{}, stream is {}x{}",
                    frame.width, frame.height, state.width, state.height
                ),
            ));
        }
        let expected = frame.width as usize * frame.height as usize * 4;
        let Some(pixels) = frame.data.get(..expected) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame holds {} bytes, expected {expected}", frame.data.len()),
            ));
        };

        let state = &mut *state;
        if state.stdin.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg input is closed"));
        }
        let can_repeat = !state.last_frame.is_empty();
        let repeats = match state.timeline.place(frame.presentation_time_ns, can_repeat) {
            Placement::Drop => return Ok(()),
            Placement::Write { repeats } => repeats,
        };
        let stdin = state
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg input is closed"))?;
        for _ in 0..repeats {
            stdin.write_all(&state.last_frame)?;
        }
        stdin.write_all(pixels)?;
        state.last_frame.clear();
        state.last_frame.extend_from_slice(pixels);
        Ok(())
    }
}
