use bytemuck::{Pod, Zeroable};

use crate::compile::{UniformBlockLayout, UniformKind};
use crate::types::RESERVED_NAMES;
use crate::viewport::Viewport;

/// Column-major 4x4 identity.
pub const IDENTITY_TRANSFORM: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Contents of the `CameraParams` block at set 0, binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    pub transform: [f32; 16],
    pub viewport: [f32; 4],
}

impl CameraUniforms {
    pub fn new(transform: [f32; 16], viewport: Viewport) -> Self {
        Self {
            transform,
            viewport: [
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
            ],
        }
    }
}

impl Default for CameraUniforms {
    fn default() -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            viewport: [0.0; 4],
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UniformError {
    #[error("uniform `{0}` is owned by the engine")]
    Reserved(String),
    #[error("uniform `{0}` is not declared in the parameter block")]
    Unknown(String),
    #[error("uniform `{name}` is {actual:?}, not {expected:?}")]
    TypeMismatch {
        name: String,
        expected: UniformKind,
        actual: UniformKind,
    },
}

/// CPU staging copy of the custom parameter block, packed with the reflected std140 offsets.
#[derive(Clone, Debug)]
pub struct ParamsBlock {
    layout: Option<UniformBlockLayout>,
    data: Vec<u8>,
}

impl ParamsBlock {
    pub fn new(layout: Option<&UniformBlockLayout>) -> Self {
        let size = layout.map(|layout| layout.size as usize).unwrap_or(0);
        Self {
            layout: layout.cloned(),
            data: vec![0; size],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn writer(&mut self) -> UniformWriter<'_> {
        UniformWriter { block: self }
    }

    fn write(&mut self, name: &str, expected: UniformKind, bytes: &[u8]) -> Result<(), UniformError> {
        if RESERVED_NAMES.contains(&name) {
            return Err(UniformError::Reserved(name.to_string()));
        }
        let member = self
            .layout
            .as_ref()
            .and_then(|layout| layout.member(name))
            .ok_or_else(|| UniformError::Unknown(name.to_string()))?;
        if member.kind != expected {
            return Err(UniformError::TypeMismatch {
                name: name.to_string(),
                expected,
                actual: member.kind,
            });
        }
        let start = member.offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(UniformError::Unknown(name.to_string()));
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Write access to the custom parameter block handed to a [`ShaderParameterBinder`].
///
/// Only members of the set 2 block are reachable; camera uniforms, the camera
/// texture and the quad attributes cannot be touched through it.
///
/// [`ShaderParameterBinder`]: crate::binder::ShaderParameterBinder
pub struct UniformWriter<'a> {
    block: &'a mut ParamsBlock,
}

impl UniformWriter<'_> {
    pub fn set_float(&mut self, name: &str, value: f32) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Float, bytemuck::bytes_of(&value))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Int, bytemuck::bytes_of(&value))
    }

    pub fn set_vec2(&mut self, name: &str, value: [f32; 2]) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Vec2, bytemuck::cast_slice(&value))
    }

    pub fn set_vec3(&mut self, name: &str, value: [f32; 3]) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Vec3, bytemuck::cast_slice(&value))
    }

    pub fn set_vec4(&mut self, name: &str, value: [f32; 4]) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Vec4, bytemuck::cast_slice(&value))
    }

    /// Column-major 4x4 matrix.
    pub fn set_mat4(&mut self, name: &str, value: [f32; 16]) -> Result<(), UniformError> {
        self.block
            .write(name, UniformKind::Mat4, bytemuck::cast_slice(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::UniformMember;

    fn layout() -> UniformBlockLayout {
        UniformBlockLayout {
            name: Some("Params".into()),
            group: 2,
            binding: 0,
            size: 32,
            members: vec![
                UniformMember {
                    name: "iGlobalTime".into(),
                    offset: 0,
                    kind: UniformKind::Float,
                },
                UniformMember {
                    name: "iResolution".into(),
                    offset: 16,
                    kind: UniformKind::Vec3,
                },
            ],
        }
    }

    #[test]
    fn camera_uniforms_match_std140_block() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 80);
        let uniforms = CameraUniforms::new(IDENTITY_TRANSFORM, Viewport::new(0, 10, 640, 360));
        assert_eq!(uniforms.viewport, [0.0, 10.0, 640.0, 360.0]);
    }

    #[test]
    fn writes_land_at_reflected_offsets() {
        let layout = layout();
        let mut block = ParamsBlock::new(Some(&layout));
        let mut writer = block.writer();
        writer.set_float("iGlobalTime", 2.5).unwrap();
        writer.set_vec3("iResolution", [4.0, 4.0, 1.0]).unwrap();

        let bytes = block.bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(f32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 2.5);
        assert_eq!(f32::from_ne_bytes(bytes[20..24].try_into().unwrap()), 4.0);
        assert_eq!(f32::from_ne_bytes(bytes[24..28].try_into().unwrap()), 1.0);
    }

    #[test]
    fn rejects_reserved_unknown_and_mismatched_writes() {
        let layout = layout();
        let mut block = ParamsBlock::new(Some(&layout));
        let mut writer = block.writer();
        assert_eq!(
            writer.set_mat4("camTextureTransform", IDENTITY_TRANSFORM),
            Err(UniformError::Reserved("camTextureTransform".into()))
        );
        assert!(matches!(
            writer.set_float("offsetR", 1.0),
            Err(UniformError::Unknown(_))
        ));
        assert!(matches!(
            writer.set_float("iResolution", 1.0),
            Err(UniformError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn programs_without_params_accept_no_writes() {
        let mut block = ParamsBlock::new(None);
        assert!(block.is_empty());
        assert!(block.writer().set_float("offsetR", 1.0).is_err());
    }
}
