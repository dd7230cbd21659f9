//! YUV4MPEG2 encoder used when no platform encoder is available.
//!
//! Frames are converted from RGBA to full-range BT.601 4:4:4 and placed on a
//! constant frame-rate timeline derived from their presentation timestamps.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::recording::{
    Encoder, EncoderError, EncoderInput, EncoderSettings, FrameSink, VideoFrame,
};
use crate::timeline::{FrameTimeline, Placement};

const FRAME_MARKER: &[u8] = b"FRAME\n";

#[derive(Default)]
pub struct Y4mEncoder {
    writer: Option<Arc<Y4mWriter>>,
}

impl Y4mEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for Y4mEncoder {
    fn file_extension(&self) -> &str {
        "y4m"
    }

    fn prepare(
        &mut self,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Result<EncoderInput, EncoderError> {
        if settings.width == 0 || settings.height == 0 {
            return Err(EncoderError::InvalidSettings(format!(
                "frame size {}x{} is empty",
                settings.width, settings.height
            )));
        }
        if settings.frame_rate == 0 {
            return Err(EncoderError::InvalidSettings(
                "frame rate must be greater than zero".into(),
            ));
        }

        let mut file = BufWriter::new(File::create(output)?);
        writeln!(
            file,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444 XCOLORRANGE=FULL",
            settings.width, settings.height, settings.frame_rate
        )?;

        let writer = Arc::new(Y4mWriter {
            state: Mutex::new(WriterState {
                file: Some(file),
                width: settings.width,
                height: settings.height,
                accepting: false,
                timeline: FrameTimeline::new(settings.frame_rate),
                last_frame: Vec::new(),
            }),
        });
        self.writer = Some(writer.clone());

        Ok(EncoderInput {
            width: settings.width,
            height: settings.height,
            sink: writer,
        })
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        let writer = self.writer.as_ref().ok_or(EncoderError::NotPrepared)?;
        let mut state = writer.lock();
        if state.file.is_none() {
            return Err(EncoderError::NotPrepared);
        }
        state.accepting = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        let writer = self.writer.as_ref().ok_or(EncoderError::NotPrepared)?;
        let mut state = writer.lock();
        state.accepting = false;
        let mut file = state.file.take().ok_or(EncoderError::NotPrepared)?;
        file.flush()?;
        tracing::debug!(frames = state.timeline.written(), "y4m stream closed");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.lock().file = None;
        }
    }
}

struct Y4mWriter {
    state: Mutex<WriterState>,
}

impl Y4mWriter {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct WriterState {
    file: Option<BufWriter<File>>,
    width: u32,
    height: u32,
    accepting: bool,
    timeline: FrameTimeline,
    last_frame: Vec<u8>,
}

impl FrameSink for Y4mWriter {
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
        if frame.data.len() < expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame holds {} bytes, expected {expected}", frame.data.len()),
            ));
        }

        let state = &mut *state;
        if state.file.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "y4m stream is closed"));
        }
        let can_repeat = !state.last_frame.is_empty();
        let repeats = match state.timeline.place(frame.presentation_time_ns, can_repeat) {
            Placement::Drop => {
                tracing::trace!(written = state.timeline.written(), "dropping early frame");
                return Ok(());
            }
            Placement::Write { repeats } => repeats,
        };

        let planes = rgba_to_yuv444(&frame.data[..expected]);
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "y4m stream is closed"))?;
        for _ in 0..repeats {
            file.write_all(FRAME_MARKER)?;
            file.write_all(&state.last_frame)?;
        }
        file.write_all(FRAME_MARKER)?;
        file.write_all(&planes)?;
        state.last_frame = planes;
        Ok(())
    }
}

/// Converts RGBA8 to planar full-range BT.601 Y, Cb, Cr.
fn rgba_to_yuv444(rgba: &[u8]) -> Vec<u8> {
    let pixels = rgba.len() / 4;
    let mut planes = vec![0u8; pixels * 3];
    let (y_plane, chroma) = planes.split_at_mut(pixels);
    let (u_plane, v_plane) = chroma.split_at_mut(pixels);
    for (index, pixel) in rgba.chunks_exact(4).enumerate() {
        let r = f32::from(pixel[0]);
        let g = f32::from(pixel[1]);
        let b = f32::from(pixel[2]);
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let u = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
        let v = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
        y_plane[index] = y.round().clamp(0.0, 255.0) as u8;
        u_plane[index] = u.round().clamp(0.0, 255.0) as u8;
        v_plane[index] = v.round().clamp(0.0, 255.0) as u8;
    }
    planes
}

/// Stream parameters parsed back from a YUV4MPEG2 file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Y4mInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub frames: u64,
}

impl Y4mInfo {
    /// Reads the header of a 4:4:4 stream and counts its frames from the file size.
    pub fn read(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        if !header.starts_with("YUV4MPEG2 ") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing YUV4MPEG2 signature",
            ));
        }

        let mut width = 0;
        let mut height = 0;
        let mut frame_rate = 0;
        for token in header.split_whitespace().skip(1) {
            let (tag, value) = token.split_at(1);
            match tag {
                "W" => width = value.parse().unwrap_or(0),
                "H" => height = value.parse().unwrap_or(0),
                "F" => {
                    frame_rate = value
                        .split(':')
                        .next()
                        .and_then(|num| num.parse().ok())
                        .unwrap_or(0)
                }
                _ => {}
            }
        }
        if width == 0 || height == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header is missing frame dimensions",
            ));
        }

        let frame_bytes = FRAME_MARKER.len() as u64 + u64::from(width) * u64::from(height) * 3;
        let payload = total.saturating_sub(header.len() as u64);
        Ok(Self {
            width,
            height,
            frame_rate,
            frames: payload / frame_bytes,
        })
    }
}
