//! GLSL program compilation and reflection.
//!
//! User shaders are GLSL 450 bodies. Before parsing, each stage is wrapped
//! with a prelude that declares the quad attributes, the camera uniform block
//! and the texture bindings the engine provides:
//!
//! | group | binding | resource                                   |
//! |-------|---------|--------------------------------------------|
//! | 0     | 0       | `CameraParams` (`camTextureTransform`, `camViewport`) |
//! | 0     | 1, 2    | camera texture and sampler (`camTexture`)  |
//! | 1     | 2n-2, 2n-1 | user texture slot `n`                   |
//! | 2     | 0       | optional custom parameter block            |
//!
//! Both stages are parsed and validated with naga, then cross-checked the way
//! a GL linker would before a [`ShaderProgram`] is handed out.

use std::collections::BTreeMap;
use std::fmt;

use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::geometry::{POSITION_LOCATION, TEX_COORD_LOCATION};
use crate::types::{user_texture_binding, TextureSlot};

pub const CAMERA_GROUP: u32 = 0;
pub const CAMERA_UNIFORM_BINDING: u32 = 0;
pub const CAMERA_TEXTURE_BINDING: u32 = 1;
pub const CAMERA_SAMPLER_BINDING: u32 = 2;
pub const TEXTURE_GROUP: u32 = 1;
pub const PARAMS_GROUP: u32 = 2;
pub const PARAMS_BINDING: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn as_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("{stage} shader failed to compile:\n{log}")]
    Compile { stage: ShaderStage, log: String },
    #[error("shader program failed to link: {log}")]
    Link { log: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Int,
    UInt,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Texture,
    Sampler,
    Other,
}

/// Where a named uniform lives once the program is linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformLocation {
    pub group: u32,
    pub binding: u32,
    /// Byte offset inside the owning block; zero for textures and samplers.
    pub offset: u32,
    pub kind: UniformKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub kind: UniformKind,
}

/// std140 layout of a uniform block as reflected from the shader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformBlockLayout {
    pub name: Option<String>,
    pub group: u32,
    pub binding: u32,
    pub size: u32,
    pub members: Vec<UniformMember>,
}

impl UniformBlockLayout {
    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|member| member.name == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Texture,
    Sampler,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceBinding {
    pub name: Option<String>,
    pub group: u32,
    pub binding: u32,
    pub kind: ResourceKind,
}

/// User texture slot as seen by the compiler: index plus macro name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotBinding {
    pub index: usize,
    pub uniform_name: String,
}

impl SlotBinding {
    pub fn texture_binding(&self) -> u32 {
        user_texture_binding(self.index)
    }

    pub fn sampler_binding(&self) -> u32 {
        self.texture_binding() + 1
    }
}

impl From<&TextureSlot> for SlotBinding {
    fn from(slot: &TextureSlot) -> Self {
        Self {
            index: slot.index,
            uniform_name: slot.uniform_name.clone(),
        }
    }
}

/// A validated vertex/fragment pair plus its reflected interface.
#[derive(Clone, Debug)]
pub struct ShaderProgram {
    vertex_source: String,
    fragment_source: String,
    attributes: BTreeMap<String, u32>,
    uniforms: BTreeMap<String, UniformLocation>,
    params: Option<UniformBlockLayout>,
    texture_slots: Vec<SlotBinding>,
}

impl ShaderProgram {
    /// Wrapped vertex source, ready for a GLSL front end.
    pub fn vertex_source(&self) -> &str {
        &self.vertex_source
    }

    /// Wrapped fragment source, ready for a GLSL front end.
    pub fn fragment_source(&self) -> &str {
        &self.fragment_source
    }

    pub fn attribute_location(&self, name: &str) -> Option<u32> {
        self.attributes.get(name).copied()
    }

    pub fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.uniforms.get(name).copied()
    }

    pub fn uniforms(&self) -> impl Iterator<Item = (&str, &UniformLocation)> {
        self.uniforms.iter().map(|(name, location)| (name.as_str(), location))
    }

    /// Layout of the custom parameter block at group 2, if the shaders declare one.
    pub fn params_layout(&self) -> Option<&UniformBlockLayout> {
        self.params.as_ref()
    }

    pub fn texture_slots(&self) -> &[SlotBinding] {
        &self.texture_slots
    }
}

/// Compiles shader pairs against a fixed set of user texture slots.
#[derive(Clone, Debug, Default)]
pub struct ShaderProgramCompiler {
    slots: Vec<SlotBinding>,
}

impl ShaderProgramCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slots<'a>(slots: impl IntoIterator<Item = &'a TextureSlot>) -> Self {
        Self {
            slots: slots.into_iter().map(SlotBinding::from).collect(),
        }
    }

    /// Compiles and links a program. Errors leave nothing registered.
    pub fn compile(&self, vertex: &str, fragment: &str) -> Result<ShaderProgram, ShaderError> {
        let vertex_source = wrap_stage(ShaderStage::Vertex, vertex, &self.slots);
        let fragment_source = wrap_stage(ShaderStage::Fragment, fragment, &self.slots);

        let vertex_module = parse_and_validate(ShaderStage::Vertex, &vertex_source)?;
        let fragment_module = parse_and_validate(ShaderStage::Fragment, &fragment_source)?;

        let vertex_interface = reflect(ShaderStage::Vertex, &vertex_module)?;
        let fragment_interface = reflect(ShaderStage::Fragment, &fragment_module)?;

        link(&vertex_interface, &fragment_interface, &self.slots)?;

        let mut uniforms = BTreeMap::new();
        let mut params = None;
        for block in vertex_interface
            .blocks
            .iter()
            .chain(fragment_interface.blocks.iter())
        {
            if block.group == PARAMS_GROUP && block.binding == PARAMS_BINDING {
                params.get_or_insert_with(|| block.clone());
            }
            for member in &block.members {
                uniforms.entry(member.name.clone()).or_insert(UniformLocation {
                    group: block.group,
                    binding: block.binding,
                    offset: member.offset,
                    kind: member.kind,
                });
            }
        }
        uniforms.insert(
            "camTexture".to_string(),
            UniformLocation {
                group: CAMERA_GROUP,
                binding: CAMERA_TEXTURE_BINDING,
                offset: 0,
                kind: UniformKind::Texture,
            },
        );
        for slot in &self.slots {
            uniforms.insert(
                slot.uniform_name.clone(),
                UniformLocation {
                    group: TEXTURE_GROUP,
                    binding: slot.texture_binding(),
                    offset: 0,
                    kind: UniformKind::Texture,
                },
            );
        }

        let mut attributes: BTreeMap<String, u32> = vertex_interface
            .inputs
            .iter()
            .filter_map(|input| input.name.clone().map(|name| (name, input.location)))
            .collect();
        attributes
            .entry("position".to_string())
            .or_insert(POSITION_LOCATION);
        attributes
            .entry("camTexCoordinate".to_string())
            .or_insert(TEX_COORD_LOCATION);

        tracing::debug!(
            uniforms = uniforms.len(),
            attributes = attributes.len(),
            has_params = params.is_some(),
            slots = self.slots.len(),
            "shader program linked"
        );

        Ok(ShaderProgram {
            vertex_source,
            fragment_source,
            attributes,
            uniforms,
            params,
            texture_slots: self.slots.clone(),
        })
    }
}

fn parse_and_validate(stage: ShaderStage, source: &str) -> Result<naga::Module, ShaderError> {
    let mut frontend = naga::front::glsl::Frontend::default();
    let options = naga::front::glsl::Options::from(stage.as_naga());
    let module = frontend
        .parse(&options, source)
        .map_err(|errors| ShaderError::Compile {
            stage,
            log: errors.to_string(),
        })?;

    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| ShaderError::Compile {
            stage,
            log: format!("{:?}", err.into_inner()),
        })?;

    Ok(module)
}

#[derive(Clone, Debug)]
struct Varying {
    name: Option<String>,
    location: u32,
    ty: String,
}

#[derive(Debug, Default)]
struct StageInterface {
    inputs: Vec<Varying>,
    outputs: Vec<Varying>,
    blocks: Vec<UniformBlockLayout>,
    resources: Vec<ResourceBinding>,
}

fn reflect(stage: ShaderStage, module: &naga::Module) -> Result<StageInterface, ShaderError> {
    let entry = module
        .entry_points
        .iter()
        .find(|entry| entry.stage == stage.as_naga() && entry.name == "main")
        .ok_or_else(|| ShaderError::Compile {
            stage,
            log: "missing `void main()` entry point".to_string(),
        })?;

    let mut interface = StageInterface::default();

    for argument in &entry.function.arguments {
        if let Some(naga::Binding::Location { location, .. }) = argument.binding {
            interface.inputs.push(Varying {
                name: argument.name.clone(),
                location,
                ty: describe_type(module, argument.ty),
            });
        }
    }

    if let Some(result) = &entry.function.result {
        match (&result.binding, &module.types[result.ty].inner) {
            (Some(naga::Binding::Location { location, .. }), _) => {
                interface.outputs.push(Varying {
                    name: None,
                    location: *location,
                    ty: describe_type(module, result.ty),
                });
            }
            (None, naga::TypeInner::Struct { members, .. }) => {
                for member in members {
                    if let Some(naga::Binding::Location { location, .. }) = member.binding {
                        interface.outputs.push(Varying {
                            name: member.name.clone(),
                            location,
                            ty: describe_type(module, member.ty),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    for (_, variable) in module.global_variables.iter() {
        let Some(binding) = &variable.binding else {
            continue;
        };
        match variable.space {
            naga::AddressSpace::Uniform => {
                let naga::TypeInner::Struct { members, span } = &module.types[variable.ty].inner
                else {
                    continue;
                };
                let is_camera_block =
                    binding.group == CAMERA_GROUP && binding.binding == CAMERA_UNIFORM_BINDING;
                let members = members
                    .iter()
                    .filter_map(|member| {
                        let name = member.name.as_deref()?;
                        // Camera members are declared with a leading underscore and exposed through macros.
                        let name = if is_camera_block {
                            name.trim_start_matches('_')
                        } else {
                            name
                        };
                        Some(UniformMember {
                            name: name.to_string(),
                            offset: member.offset,
                            kind: uniform_kind(&module.types[member.ty].inner),
                        })
                    })
                    .collect();
                interface.blocks.push(UniformBlockLayout {
                    name: module.types[variable.ty].name.clone(),
                    group: binding.group,
                    binding: binding.binding,
                    size: *span,
                    members,
                });
            }
            naga::AddressSpace::Handle => {
                let kind = match module.types[variable.ty].inner {
                    naga::TypeInner::Image { .. } => ResourceKind::Texture,
                    naga::TypeInner::Sampler { .. } => ResourceKind::Sampler,
                    _ => continue,
                };
                interface.resources.push(ResourceBinding {
                    name: variable.name.clone(),
                    group: binding.group,
                    binding: binding.binding,
                    kind,
                });
            }
            _ => {}
        }
    }

    Ok(interface)
}

fn link(
    vertex: &StageInterface,
    fragment: &StageInterface,
    slots: &[SlotBinding],
) -> Result<(), ShaderError> {
    for input in &fragment.inputs {
        let Some(output) = vertex
            .outputs
            .iter()
            .find(|output| output.location == input.location)
        else {
            return Err(ShaderError::Link {
                log: format!(
                    "fragment input {} at location {} is not written by the vertex stage",
                    display_name(&input.name),
                    input.location
                ),
            });
        };
        if output.ty != input.ty {
            return Err(ShaderError::Link {
                log: format!(
                    "location {} is {} in the vertex stage but {} in the fragment stage",
                    input.location, output.ty, input.ty
                ),
            });
        }
    }

    if !fragment.outputs.iter().any(|output| output.location == 0) {
        return Err(ShaderError::Link {
            log: "fragment stage does not write a colour output at location 0".to_string(),
        });
    }

    for block in vertex.blocks.iter().chain(fragment.blocks.iter()) {
        let allowed = (block.group == CAMERA_GROUP && block.binding == CAMERA_UNIFORM_BINDING)
            || (block.group == PARAMS_GROUP && block.binding == PARAMS_BINDING);
        if !allowed {
            return Err(ShaderError::Link {
                log: format!(
                    "uniform block {} uses unsupported binding (set = {}, binding = {}); custom parameters belong in set = {PARAMS_GROUP}, binding = {PARAMS_BINDING}",
                    display_name(&block.name),
                    block.group,
                    block.binding
                ),
            });
        }
    }

    for block in &vertex.blocks {
        if let Some(other) = fragment
            .blocks
            .iter()
            .find(|other| other.group == block.group && other.binding == block.binding)
        {
            if other.members != block.members {
                return Err(ShaderError::Link {
                    log: format!(
                        "uniform block {} at (set = {}, binding = {}) differs between stages",
                        display_name(&block.name),
                        block.group,
                        block.binding
                    ),
                });
            }
        }
    }

    for resource in vertex.resources.iter().chain(fragment.resources.iter()) {
        let allowed = match (resource.group, resource.kind) {
            (CAMERA_GROUP, ResourceKind::Texture) => resource.binding == CAMERA_TEXTURE_BINDING,
            (CAMERA_GROUP, ResourceKind::Sampler) => resource.binding == CAMERA_SAMPLER_BINDING,
            (TEXTURE_GROUP, ResourceKind::Texture) => slots
                .iter()
                .any(|slot| slot.texture_binding() == resource.binding),
            (TEXTURE_GROUP, ResourceKind::Sampler) => slots
                .iter()
                .any(|slot| slot.sampler_binding() == resource.binding),
            _ => false,
        };
        if !allowed {
            return Err(ShaderError::Link {
                log: format!(
                    "{} {} uses unsupported binding (set = {}, binding = {})",
                    match resource.kind {
                        ResourceKind::Texture => "texture",
                        ResourceKind::Sampler => "sampler",
                    },
                    display_name(&resource.name),
                    resource.group,
                    resource.binding
                ),
            });
        }
    }

    Ok(())
}

fn display_name(name: &Option<String>) -> String {
    name.as_deref()
        .map(|name| format!("`{name}`"))
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn describe_type(module: &naga::Module, ty: naga::Handle<naga::Type>) -> String {
    match &module.types[ty].inner {
        naga::TypeInner::Scalar(scalar) => format!("{:?}{}", scalar.kind, scalar.width * 8),
        naga::TypeInner::Vector { size, scalar } => {
            format!("vec{}<{:?}{}>", *size as u8, scalar.kind, scalar.width * 8)
        }
        naga::TypeInner::Matrix { columns, rows, .. } => {
            format!("mat{}x{}", *columns as u8, *rows as u8)
        }
        other => format!("{other:?}"),
    }
}

fn uniform_kind(inner: &naga::TypeInner) -> UniformKind {
    use naga::{ScalarKind, TypeInner, VectorSize};

    match inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float if scalar.width == 4 => UniformKind::Float,
            ScalarKind::Sint => UniformKind::Int,
            ScalarKind::Uint => UniformKind::UInt,
            _ => UniformKind::Other,
        },
        TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float => match size {
            VectorSize::Bi => UniformKind::Vec2,
            VectorSize::Tri => UniformKind::Vec3,
            VectorSize::Quad => UniformKind::Vec4,
        },
        TypeInner::Matrix {
            columns: VectorSize::Quad,
            rows: VectorSize::Quad,
            ..
        } => UniformKind::Mat4,
        TypeInner::Image { .. } => UniformKind::Texture,
        TypeInner::Sampler { .. } => UniformKind::Sampler,
        _ => UniformKind::Other,
    }
}

/// Produces a self-contained GLSL 450 stage from a user shader body.
///
/// `#version`, `precision` statements and the external-image extension
/// directive are dropped since the prelude owns them.
pub(crate) fn wrap_stage(stage: ShaderStage, source: &str, slots: &[SlotBinding]) -> String {
    let mut body = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        let skip = trimmed.starts_with("#version")
            || (trimmed.starts_with("precision ") && trimmed.trim_end().ends_with(';'))
            || (trimmed.starts_with("#extension") && trimmed.contains("GL_OES_EGL_image_external"));
        if skip {
            // Keep line numbers in compiler logs aligned with the user's file.
            body.push('\n');
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }

    let mut prelude = String::from("#version 450\n");
    if stage == ShaderStage::Vertex {
        prelude.push_str(VERTEX_ATTRIBUTES);
    }
    prelude.push_str(CAMERA_BLOCK);
    if stage == ShaderStage::Fragment {
        prelude.push_str(CAMERA_TEXTURE);
        for slot in slots {
            prelude.push_str(&format!(
                "layout(set = {TEXTURE_GROUP}, binding = {tex}) uniform texture2D shadercam_slot{index}_texture;\n\
                 layout(set = {TEXTURE_GROUP}, binding = {smp}) uniform sampler shadercam_slot{index}_sampler;\n\
                 #define {name} sampler2D(shadercam_slot{index}_texture, shadercam_slot{index}_sampler)\n",
                tex = slot.texture_binding(),
                smp = slot.sampler_binding(),
                index = slot.index,
                name = slot.uniform_name,
            ));
        }
    }

    format!("{prelude}#line 1\n{body}")
}

const VERTEX_ATTRIBUTES: &str = r"layout(location = 0) in vec2 position;
layout(location = 1) in vec2 camTexCoordinate;
";

/// Must stay in sync with `CameraUniforms` in `uniforms.rs`.
const CAMERA_BLOCK: &str = r"layout(std140, set = 0, binding = 0) uniform CameraParams {
    mat4 _camTextureTransform;
    vec4 _camViewport;
} shadercam_camera;
#define camTextureTransform shadercam_camera._camTextureTransform
#define camViewport shadercam_camera._camViewport
";

const CAMERA_TEXTURE: &str = r"layout(set = 0, binding = 1) uniform texture2D shadercam_camera_texture;
layout(set = 0, binding = 2) uniform sampler shadercam_camera_sampler;
#define camTexture sampler2D(shadercam_camera_texture, shadercam_camera_sampler)
";

/// Pass-through vertex stage applying the camera transform.
pub const PASSTHROUGH_VERTEX: &str = r"layout(location = 0) out vec2 v_CamTexCoordinate;

void main() {
    v_CamTexCoordinate = (camTextureTransform * vec4(camTexCoordinate, 0.0, 1.0)).xy;
    gl_Position = vec4(position, 0.0, 1.0);
}
";

/// Pass-through fragment stage sampling the camera texture.
pub const PASSTHROUGH_FRAGMENT: &str = r"layout(location = 0) in vec2 v_CamTexCoordinate;
layout(location = 0) out vec4 fragColor;

void main() {
    fragColor = texture(camTexture, v_CamTexCoordinate);
}
";
