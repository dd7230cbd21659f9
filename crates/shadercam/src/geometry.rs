//! Full-screen quad shared by every shader program.
//!
//! Positions cover clip space with the top-left corner first. Texture
//! coordinates follow the wgpu convention where `v = 0` is the top row of an
//! uploaded image, so an identity camera transform shows the frame upright.

use bytemuck::{Pod, Zeroable};

/// Attribute location of the quad position, `vec2 position`.
pub const POSITION_LOCATION: u32 = 0;
/// Attribute location of the camera texture coordinate, `vec2 camTexCoordinate`.
pub const TEX_COORD_LOCATION: u32 = 1;

pub const QUAD_POSITIONS: [[f32; 2]; 4] = [[-1.0, 1.0], [1.0, 1.0], [-1.0, -1.0], [1.0, -1.0]];

pub const QUAD_TEX_COORDS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

/// Two triangles: top-left, top-right, bottom-left then top-right, bottom-right, bottom-left.
pub const QUAD_DRAW_ORDER: [u16; 6] = [0, 1, 2, 1, 3, 2];

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coord: [f32; 2],
}

/// CPU-side copy of the quad, uploaded once per graphics context.
#[derive(Clone, Debug)]
pub struct GeometryBuffers {
    vertices: [QuadVertex; 4],
    indices: [u16; 6],
}

impl GeometryBuffers {
    pub fn quad() -> Self {
        let mut vertices = [QuadVertex::zeroed(); 4];
        for (vertex, (position, tex_coord)) in vertices
            .iter_mut()
            .zip(QUAD_POSITIONS.iter().zip(QUAD_TEX_COORDS.iter()))
        {
            vertex.position = *position;
            vertex.tex_coord = *tex_coord;
        }
        Self {
            vertices,
            indices: QUAD_DRAW_ORDER,
        }
    }

    pub fn vertices(&self) -> &[QuadVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub const fn vertex_stride() -> u64 {
        std::mem::size_of::<QuadVertex>() as u64
    }

    pub const fn tex_coord_offset() -> u64 {
        std::mem::size_of::<[f32; 2]>() as u64
    }
}

impl Default for GeometryBuffers {
    fn default() -> Self {
        Self::quad()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_covers_clip_space_with_two_triangles() {
        let geometry = GeometryBuffers::quad();
        assert_eq!(geometry.index_count(), 6);
        assert_eq!(geometry.indices(), &[0, 1, 2, 1, 3, 2]);
        let xs: Vec<f32> = geometry.vertices().iter().map(|v| v.position[0]).collect();
        assert_eq!(xs, vec![-1.0, 1.0, -1.0, 1.0]);
    }

    #[test]
    fn vertex_layout_is_interleaved() {
        let geometry = GeometryBuffers::quad();
        assert_eq!(GeometryBuffers::vertex_stride(), 16);
        assert_eq!(geometry.vertex_bytes().len(), 64);
        assert_eq!(geometry.index_bytes().len(), 12);
        assert_eq!(geometry.vertices()[3].tex_coord, [1.0, 1.0]);
    }
}
