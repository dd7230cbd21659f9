use std::path::{Path, PathBuf};

use crate::recording::EncoderSettings;

/// Total texture slots available to a program, including the camera slot.
pub const MAX_TEXTURES: usize = 16;

/// Slot permanently owned by the camera texture.
pub const CAMERA_TEXTURE_SLOT: usize = 0;

/// Shader purpose used when no explicit pair is configured.
pub const DEFAULT_SHADER_PURPOSE: &str = "camera";

/// Names owned by the engine that user slots and parameter blocks may not claim.
pub const RESERVED_NAMES: [&str; 5] = [
    "position",
    "camTexCoordinate",
    "camTextureTransform",
    "camTexture",
    "camViewport",
];

#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error("texture slots exhausted; at most {} user textures are supported", MAX_TEXTURES - 1)]
    TooMany,
    #[error("texture uniform `{0}` is not a valid GLSL identifier")]
    InvalidName(String),
    #[error("texture uniform `{0}` is reserved")]
    Reserved(String),
    #[error("texture uniform `{0}` is already bound")]
    Duplicate(String),
    #[error("failed to load texture `{name}` from {path}: {source}")]
    Load {
        name: String,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Describes where a user texture is read from.
#[derive(Clone, Debug)]
pub enum TextureSource {
    Path(PathBuf),
    Image(image::RgbaImage),
}

/// One user texture slot. Indices start at 1; slot 0 is the camera.
#[derive(Clone, Debug)]
pub struct TextureSlot {
    pub index: usize,
    pub uniform_name: String,
    pub source: TextureSource,
}

/// Texture binding of user slot `index` within the user texture group.
/// Each slot takes two bindings: the texture, then its sampler.
pub fn user_texture_binding(index: usize) -> u32 {
    (index as u32 - 1) * 2
}

impl TextureSlot {
    /// Texture binding within the user texture group.
    pub fn texture_binding(&self) -> u32 {
        user_texture_binding(self.index)
    }

    /// Sampler binding within the user texture group.
    pub fn sampler_binding(&self) -> u32 {
        self.texture_binding() + 1
    }
}

/// User textures registered before the engine starts.
#[derive(Clone, Debug, Default)]
pub struct TextureBindings {
    slots: Vec<TextureSlot>,
}

impl TextureBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a texture and returns the slot index it occupies.
    pub fn add(
        &mut self,
        uniform_name: impl Into<String>,
        source: TextureSource,
    ) -> Result<usize, TextureError> {
        let uniform_name = uniform_name.into();
        if !is_glsl_identifier(&uniform_name) {
            return Err(TextureError::InvalidName(uniform_name));
        }
        if RESERVED_NAMES.contains(&uniform_name.as_str()) || uniform_name.starts_with("shadercam_")
        {
            return Err(TextureError::Reserved(uniform_name));
        }
        if self.slots.iter().any(|slot| slot.uniform_name == uniform_name) {
            return Err(TextureError::Duplicate(uniform_name));
        }
        if self.slots.len() + 1 >= MAX_TEXTURES {
            return Err(TextureError::TooMany);
        }

        let index = self.slots.len() + 1;
        self.slots.push(TextureSlot {
            index,
            uniform_name,
            source,
        });
        Ok(index)
    }

    pub fn slots(&self) -> &[TextureSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decodes every path-backed slot so load failures surface before the render thread exists.
    pub fn load(&self) -> Result<Vec<LoadedTexture>, TextureError> {
        self.slots
            .iter()
            .map(|slot| {
                let image = match &slot.source {
                    TextureSource::Image(image) => image.clone(),
                    TextureSource::Path(path) => image::open(path)
                        .map_err(|source| TextureError::Load {
                            name: slot.uniform_name.clone(),
                            path: path.clone(),
                            source,
                        })?
                        .to_rgba8(),
                };
                Ok(LoadedTexture {
                    slot: slot.clone(),
                    image,
                })
            })
            .collect()
    }
}

/// A user texture decoded to RGBA8 and ready for upload.
#[derive(Clone, Debug)]
pub struct LoadedTexture {
    pub slot: TextureSlot,
    pub image: image::RgbaImage,
}

pub(crate) fn is_glsl_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    !name.starts_with("gl_") && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// How the preview frame reaches the recording surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Run the full draw routine again against the recording surface.
    #[default]
    Redraw,
    /// Copy the preview colour buffer when the context supports it, redrawing otherwise.
    Blit,
}

/// Vertex and fragment shader files making up one program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl ShaderPaths {
    pub fn new(vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    /// Resolves `<purpose>.vert.glsl` and `<purpose>.frag.glsl` inside `dir`.
    pub fn for_purpose(dir: &Path, purpose: &str) -> Self {
        Self {
            vertex: dir.join(format!("{purpose}.vert.glsl")),
            fragment: dir.join(format!("{purpose}.frag.glsl")),
        }
    }
}

/// Shader sources read from disk.
#[derive(Clone, Debug)]
pub struct ShaderSources {
    pub vertex: String,
    pub fragment: String,
}

/// Everything the engine needs before its render thread is spawned.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub shaders: ShaderPaths,
    pub preview_size: (u32, u32),
    pub recording: EncoderSettings,
    /// Private directory that receives in-progress recordings.
    pub cache_dir: PathBuf,
    pub copy_strategy: CopyStrategy,
    pub clear_color: [f32; 4],
    pub textures: TextureBindings,
}

impl EngineConfig {
    pub fn new(shaders: ShaderPaths, preview_size: (u32, u32)) -> Self {
        Self {
            shaders,
            preview_size,
            recording: EncoderSettings::default(),
            cache_dir: std::env::temp_dir(),
            copy_strategy: CopyStrategy::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            textures: TextureBindings::new(),
        }
    }
}
