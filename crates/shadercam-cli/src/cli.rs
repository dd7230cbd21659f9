use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "shadercam",
    author,
    version,
    about = "Camera-to-shader preview and recording pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive the pipeline with a synthetic camera and optionally record the shaded output.
    Run(RunArgs),
    /// Compile a shader pair on the CPU and print its reflected interface.
    Check(CheckArgs),
}

/// Shader and texture selection shared by every subcommand.
#[derive(Args, Debug, Default)]
pub struct ShaderArgs {
    /// TOML configuration file; defaults to `config.toml` in the config directory when present.
    #[arg(long, env = "SHADERCAM_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding `<purpose>.vert.glsl` and `<purpose>.frag.glsl`.
    #[arg(long, value_name = "DIR")]
    pub shader_dir: Option<PathBuf>,

    /// Shader pair name inside `--shader-dir` (default `camera`).
    #[arg(long, value_name = "NAME")]
    pub purpose: Option<String>,

    /// Explicit vertex shader; requires `--fragment`.
    #[arg(long, value_name = "FILE", requires = "fragment")]
    pub vertex: Option<PathBuf>,

    /// Explicit fragment shader; requires `--vertex`.
    #[arg(long, value_name = "FILE", requires = "vertex")]
    pub fragment: Option<PathBuf>,

    /// Extra texture bound to a sampler uniform, as `NAME=PATH`. Repeatable.
    #[arg(long = "texture", value_name = "NAME=PATH", value_parser = parse_texture)]
    pub textures: Vec<(String, PathBuf)>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub shaders: ShaderArgs,

    /// Destination of the recording; a timestamped name is generated when omitted.
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Number of synthetic camera frames to push.
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u32>,

    /// Frame index at which recording starts.
    #[arg(long, value_name = "INDEX")]
    pub record_from: Option<u32>,

    /// Frame index at which recording stops.
    #[arg(long, value_name = "INDEX", requires = "record_from")]
    pub record_until: Option<u32>,

    /// Synthetic camera resolution (e.g. `640x480`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub camera_size: Option<(u32, u32)>,

    /// Offscreen preview resolution (e.g. `720x1280`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub preview_size: Option<(u32, u32)>,

    /// How frames reach the recording surface.
    #[arg(long, value_enum)]
    pub copy: Option<CopyArg>,

    /// Custom uniform strategy.
    #[arg(long, value_enum)]
    pub binder: Option<BinderArg>,

    /// Recording container; `mp4` needs `ffmpeg`.
    #[arg(long, value_enum)]
    pub encoder: Option<EncoderArg>,

    /// `ffmpeg` executable for MP4 recordings.
    #[arg(long, env = "SHADERCAM_FFMPEG", value_name = "PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// Push frames as fast as the engine accepts them instead of pacing by the frame interval.
    #[arg(long)]
    pub unpaced: bool,

    /// Prefer a software adapter.
    #[arg(long, env = "SHADERCAM_FALLBACK_ADAPTER")]
    pub fallback_adapter: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub shaders: ShaderArgs,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CopyArg {
    Redraw,
    Blit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EncoderArg {
    Mp4,
    Y4m,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BinderArg {
    Passthrough,
    TouchColor,
    TileTime,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let parse = |raw: &str| {
        raw.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))
    };
    let size = (parse(width)?, parse(height)?);
    if size.0 == 0 || size.1 == 0 {
        return Err(format!("size '{trimmed}' must be non-zero"));
    }
    Ok(size)
}

pub fn parse_texture(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("invalid texture '{value}'; expected NAME=PATH"))?;
    let name = name.trim();
    if name.is_empty() || path.trim().is_empty() {
        return Err(format!("invalid texture '{value}'; expected NAME=PATH"));
    }
    Ok((name.to_string(), PathBuf::from(path.trim())))
}
