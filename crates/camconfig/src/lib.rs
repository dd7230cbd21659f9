use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CamConfig {
    pub version: u32,
    #[serde(default)]
    pub shaders: ShaderSection,
    #[serde(default)]
    pub preview: PreviewSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub camera: CameraSection,
    #[serde(default)]
    pub binder: BinderSection,
    #[serde(default)]
    pub textures: Vec<TextureEntry>,
}

impl Default for CamConfig {
    fn default() -> Self {
        Self {
            version: 1,
            shaders: ShaderSection::default(),
            preview: PreviewSection::default(),
            recording: RecordingSection::default(),
            camera: CameraSection::default(),
            binder: BinderSection::default(),
            textures: Vec::new(),
        }
    }
}

/// Shader pair selection. Explicit paths win over `dir` + `purpose`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShaderSection {
    pub dir: Option<PathBuf>,
    pub purpose: Option<String>,
    pub vertex: Option<PathBuf>,
    pub fragment: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    #[default]
    Redraw,
    Blit,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreviewSection {
    #[serde(default = "default_preview_width")]
    pub width: u32,
    #[serde(default = "default_preview_height")]
    pub height: u32,
    #[serde(default)]
    pub copy: CopyMode,
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
}

impl Default for PreviewSection {
    fn default() -> Self {
        Self {
            width: default_preview_width(),
            height: default_preview_height(),
            copy: CopyMode::default(),
            clear_color: default_clear_color(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// H.264 MP4 through the system `ffmpeg`.
    #[default]
    Mp4,
    /// Uncompressed YUV4MPEG2; needs no external tools.
    Y4m,
}

/// Encoder parameters. Defaults match the portrait 720x1280 @ 30 fps profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingSection {
    #[serde(default)]
    pub encoder: EncoderKind,
    /// `ffmpeg` executable used by the MP4 encoder; looked up on `PATH` when unset.
    pub ffmpeg: Option<PathBuf>,
    #[serde(default = "default_video_width")]
    pub width: u32,
    #[serde(default = "default_video_height")]
    pub height: u32,
    #[serde(default = "default_video_bit_rate")]
    pub video_bit_rate: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default = "default_audio_bit_rate")]
    pub audio_bit_rate: u32,
    #[serde(default)]
    pub orientation_hint: u32,
    /// Directory finished recordings are written to when no explicit output is given.
    pub output_dir: Option<PathBuf>,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::default(),
            ffmpeg: None,
            width: default_video_width(),
            height: default_video_height(),
            video_bit_rate: default_video_bit_rate(),
            frame_rate: default_frame_rate(),
            audio_bit_rate: default_audio_bit_rate(),
            orientation_hint: 0,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraPattern {
    #[default]
    Gradient,
    Checker,
    Solid,
}

/// Synthetic camera driving the pipeline from the command line.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraSection {
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(
        default = "default_frame_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub frame_interval: Duration,
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(default)]
    pub pattern: CameraPattern,
    /// Frame index at which recording starts; no recording when unset.
    pub record_from: Option<u32>,
    /// Frame index at which recording stops; runs to the last frame when unset.
    pub record_until: Option<u32>,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            width: default_camera_width(),
            height: default_camera_height(),
            frame_interval: default_frame_interval(),
            frames: default_frames(),
            pattern: CameraPattern::default(),
            record_from: None,
            record_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinderKind {
    #[default]
    Passthrough,
    TouchColor,
    TileTime,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BinderSection {
    #[serde(default)]
    pub kind: BinderKind,
    /// Tile amount for `tile_time`.
    pub tiles: Option<f32>,
    /// Fixed touch position in preview pixels for `touch_color`.
    pub touch: Option<[f32; 2]>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextureEntry {
    pub name: String,
    pub path: PathBuf,
}

fn default_preview_width() -> u32 {
    720
}

fn default_preview_height() -> u32 {
    1280
}

fn default_clear_color() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn default_video_width() -> u32 {
    720
}

fn default_video_height() -> u32 {
    1280
}

fn default_video_bit_rate() -> u32 {
    10_000_000
}

fn default_frame_rate() -> u32 {
    30
}

fn default_audio_bit_rate() -> u32 {
    44_800
}

fn default_camera_width() -> u32 {
    640
}

fn default_camera_height() -> u32 {
    480
}

fn default_frame_interval() -> Duration {
    Duration::from_millis(33)
}

fn default_frames() -> u32 {
    90
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or(default_frame_interval()))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of milliseconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v / 1000.0)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl CamConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: CamConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Frames `[from, until)` the synthetic camera records, if any.
    pub fn record_window(&self) -> Option<(u32, u32)> {
        let from = self.camera.record_from?;
        Some((from, self.camera.record_until.unwrap_or(self.camera.frames)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if let Some(purpose) = &self.shaders.purpose {
            if purpose.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "shaders.purpose may not be empty".into(),
                ));
            }
        }
        if self.shaders.vertex.is_some() != self.shaders.fragment.is_some() {
            return Err(ConfigError::Invalid(
                "shaders.vertex and shaders.fragment must be set together".into(),
            ));
        }

        non_zero_size("preview", self.preview.width, self.preview.height)?;
        if self
            .preview
            .clear_color
            .iter()
            .any(|channel| !(0.0..=1.0).contains(channel))
        {
            return Err(ConfigError::Invalid(
                "preview.clear_color components must be within 0..=1".into(),
            ));
        }

        non_zero_size("recording", self.recording.width, self.recording.height)?;
        if self.recording.frame_rate == 0 {
            return Err(ConfigError::Invalid(
                "recording.frame_rate must be greater than zero".into(),
            ));
        }
        if self.recording.video_bit_rate == 0 {
            return Err(ConfigError::Invalid(
                "recording.video_bit_rate must be greater than zero".into(),
            ));
        }

        non_zero_size("camera", self.camera.width, self.camera.height)?;
        if self.camera.frame_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "camera.frame_interval must be greater than zero".into(),
            ));
        }
        if self.camera.record_until.is_some() && self.camera.record_from.is_none() {
            return Err(ConfigError::Invalid(
                "camera.record_until requires camera.record_from".into(),
            ));
        }
        if let Some((from, until)) = self.record_window() {
            if from >= until || until > self.camera.frames {
                return Err(ConfigError::Invalid(format!(
                    "camera record window {from}..{until} must be non-empty and within {} frames",
                    self.camera.frames
                )));
            }
        }

        if let Some(tiles) = self.binder.tiles {
            if !tiles.is_finite() || tiles <= 0.0 {
                return Err(ConfigError::Invalid(
                    "binder.tiles must be a positive number".into(),
                ));
            }
        }
        if let Some([x, y]) = self.binder.touch {
            if x < 0.0 || y < 0.0 {
                return Err(ConfigError::Invalid(
                    "binder.touch coordinates must be non-negative".into(),
                ));
            }
        }

        for (index, texture) in self.textures.iter().enumerate() {
            if texture.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "texture #{} has an empty name",
                    index + 1
                )));
            }
            if self.textures[..index]
                .iter()
                .any(|other| other.name == texture.name)
            {
                return Err(ConfigError::Invalid(format!(
                    "texture '{}' is configured twice",
                    texture.name
                )));
            }
        }

        Ok(())
    }
}

fn non_zero_size(section: &str, width: u32, height: u32) -> Result<(), ConfigError> {
    if width == 0 || height == 0 {
        return Err(ConfigError::Invalid(format!(
            "{section} size {width}x{height} must be non-zero"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[shaders]
dir = "shaders"
purpose = "sepia"

[preview]
width = 360
height = 640
copy = "blit"

[recording]
encoder = "y4m"
width = 360
height = 640
frame_rate = 24
output_dir = "/tmp/clips"

[camera]
width = 320
height = 240
frame_interval = "40ms"
frames = 60
pattern = "checker"
record_from = 10
record_until = 50

[binder]
kind = "tile_time"
tiles = 42.0

[[textures]]
name = "overlay"
path = "overlay.png"
"#;

    #[test]
    fn parses_sample_config() {
        let config = CamConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.version, 1);
        assert_eq!(config.shaders.purpose.as_deref(), Some("sepia"));
        assert_eq!(config.preview.copy, CopyMode::Blit);
        assert_eq!(config.recording.frame_rate, 24);
        assert_eq!(config.recording.encoder, EncoderKind::Y4m);
        assert_eq!(config.recording.video_bit_rate, 10_000_000);
        assert_eq!(config.camera.frame_interval, Duration::from_millis(40));
        assert_eq!(config.camera.pattern, CameraPattern::Checker);
        assert_eq!(config.record_window(), Some((10, 50)));
        assert_eq!(config.binder.kind, BinderKind::TileTime);
        assert_eq!(config.textures[0].name, "overlay");
    }

    #[test]
    fn minimal_config_uses_recording_defaults() {
        let config = CamConfig::from_toml_str("version = 1").unwrap();
        assert_eq!((config.recording.width, config.recording.height), (720, 1280));
        assert_eq!(config.recording.frame_rate, 30);
        assert_eq!(config.recording.audio_bit_rate, 44_800);
        assert_eq!(config.recording.orientation_hint, 0);
        assert_eq!(config.recording.encoder, EncoderKind::Mp4);
        assert!(config.recording.ffmpeg.is_none());
        assert_eq!(config.preview.copy, CopyMode::Redraw);
        assert_eq!(config.camera.frame_interval, Duration::from_millis(33));
        assert_eq!(config.record_window(), None);
    }

    #[test]
    fn default_config_validates() {
        CamConfig::default().validate().unwrap();
    }

    #[test]
    fn numeric_interval_is_milliseconds() {
        let config = CamConfig::from_toml_str(
            r#"
version = 1

[camera]
frame_interval = 50
"#,
        )
        .unwrap();
        assert_eq!(config.camera.frame_interval, Duration::from_millis(50));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = CamConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_record_window_past_last_frame() {
        let err = CamConfig::from_toml_str(
            r#"
version = 1

[camera]
frames = 30
record_from = 5
record_until = 31
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_half_specified_shader_pair() {
        let err = CamConfig::from_toml_str(
            r#"
version = 1

[shaders]
fragment = "tint.frag.glsl"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_textures() {
        let err = CamConfig::from_toml_str(
            r#"
version = 1

[[textures]]
name = "overlay"
path = "a.png"

[[textures]]
name = "overlay"
path = "b.png"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = CamConfig::from_toml_str("version = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
