use std::borrow::Cow;
use std::collections::HashMap;

use wgpu::naga::ShaderStage;
use wgpu::util::DeviceExt;

use crate::compile::{
    ShaderProgram, SlotBinding, CAMERA_SAMPLER_BINDING, CAMERA_TEXTURE_BINDING,
    CAMERA_UNIFORM_BINDING, PARAMS_BINDING,
};
use crate::geometry::{GeometryBuffers, POSITION_LOCATION, TEX_COORD_LOCATION};
use crate::uniforms::CameraUniforms;

use super::textures::TextureSet;

/// Layouts for the three bind groups every program uses: camera (0), user textures (1), params (2).
pub(crate) struct ProgramLayouts {
    camera: wgpu::BindGroupLayout,
    slots: wgpu::BindGroupLayout,
    params: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

impl ProgramLayouts {
    fn new(device: &wgpu::Device, slots: &[SlotBinding]) -> Self {
        let camera = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("camera layout"),
            entries: &[
                uniform_entry(CAMERA_UNIFORM_BINDING),
                texture_entry(CAMERA_TEXTURE_BINDING),
                sampler_entry(CAMERA_SAMPLER_BINDING),
            ],
        });
        let slots = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("user texture layout"),
            entries: &build_slot_layout_entries(slots),
        });
        let params = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("params layout"),
            entries: &[uniform_entry(PARAMS_BINDING)],
        });
        let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("shadercam pipeline layout"),
            bind_group_layouts: &[&camera, &slots, &params],
            push_constant_ranges: &[],
        });
        Self {
            camera,
            slots,
            params,
            pipeline,
        }
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

pub(crate) fn build_slot_layout_entries(slots: &[SlotBinding]) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(slots.len() * 2);
    for slot in slots {
        entries.push(texture_entry(slot.texture_binding()));
        entries.push(sampler_entry(slot.sampler_binding()));
    }
    entries
}

/// Bind groups built against a particular [`TextureSet`] generation.
struct BoundGroups {
    generation: u64,
    camera: wgpu::BindGroup,
    slots: wgpu::BindGroup,
}

/// A linked program: shader modules, uniform buffers and one render pipeline per target format.
pub(crate) struct ShaderPipeline {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    layouts: ProgramLayouts,
    slots: Vec<SlotBinding>,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    camera_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    params_group: wgpu::BindGroup,
    bound: Option<BoundGroups>,
}

impl ShaderPipeline {
    pub fn new(device: &wgpu::Device, program: &ShaderProgram) -> Self {
        let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shadercam vertex"),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Owned(program.vertex_source().to_string()),
                stage: ShaderStage::Vertex,
                defines: &[],
            },
        });
        let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shadercam fragment"),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Owned(program.fragment_source().to_string()),
                stage: ShaderStage::Fragment,
                defines: &[],
            },
        });
        let layouts = ProgramLayouts::new(device, program.texture_slots());

        let camera_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("camera uniforms"),
            contents: bytemuck::bytes_of(&CameraUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        // Programs without a params block still bind group 2, so keep a minimal buffer.
        let params_size = program
            .params_layout()
            .map(|layout| u64::from(layout.size))
            .unwrap_or(0)
            .max(16);
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("custom params"),
            size: params_size.next_multiple_of(16),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let params_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("params bind group"),
            layout: &layouts.params,
            entries: &[wgpu::BindGroupEntry {
                binding: PARAMS_BINDING,
                resource: params_buffer.as_entire_binding(),
            }],
        });

        Self {
            vertex,
            fragment,
            layouts,
            slots: program.texture_slots().to_vec(),
            pipelines: HashMap::new(),
            camera_buffer,
            params_buffer,
            params_group,
            bound: None,
        }
    }

    pub fn write_uniforms(&self, queue: &wgpu::Queue, camera: &CameraUniforms, params: &[u8]) {
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(camera));
        if !params.is_empty() {
            queue.write_buffer(&self.params_buffer, 0, params);
        }
    }

    /// Rebuilds the camera and slot bind groups if the textures changed since the last draw.
    pub fn bind_textures(&mut self, device: &wgpu::Device, textures: &TextureSet) {
        if self
            .bound
            .as_ref()
            .is_some_and(|bound| bound.generation == textures.generation())
        {
            return;
        }
        let camera = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("camera bind group"),
            layout: &self.layouts.camera,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: CAMERA_UNIFORM_BINDING,
                    resource: self.camera_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: CAMERA_TEXTURE_BINDING,
                    resource: wgpu::BindingResource::TextureView(&textures.camera.view),
                },
                wgpu::BindGroupEntry {
                    binding: CAMERA_SAMPLER_BINDING,
                    resource: wgpu::BindingResource::Sampler(&textures.camera.sampler),
                },
            ],
        });
        let slots = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("user texture bind group"),
            layout: &self.layouts.slots,
            entries: &build_slot_entries(&self.slots, textures),
        });
        self.bound = Some(BoundGroups {
            generation: textures.generation(),
            camera,
            slots,
        });
    }

    /// Render pipeline targeting `format`, created on first use.
    pub fn pipeline_for(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
    ) -> wgpu::RenderPipeline {
        let Self {
            pipelines,
            vertex,
            fragment,
            layouts,
            ..
        } = self;
        pipelines.entry(format).or_insert_with(|| {
            tracing::debug!(?format, "building render pipeline");
            build_pipeline(device, &layouts.pipeline, vertex, fragment, format)
        })
        .clone()
    }

    pub fn encode(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        pipeline: &wgpu::RenderPipeline,
        geometry: &GeometryGpu,
    ) {
        let Some(bound) = self.bound.as_ref() else {
            return;
        };
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bound.camera, &[]);
        pass.set_bind_group(1, &bound.slots, &[]);
        pass.set_bind_group(2, &self.params_group, &[]);
        pass.set_vertex_buffer(0, geometry.vertices.slice(..));
        pass.set_index_buffer(geometry.indices.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..geometry.index_count, 0, 0..1);
    }
}

pub(crate) fn build_slot_entries<'a>(
    slots: &[SlotBinding],
    textures: &'a TextureSet,
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = Vec::with_capacity(slots.len() * 2);
    for slot in slots {
        let texture = textures.slot(slot.index);
        entries.push(wgpu::BindGroupEntry {
            binding: slot.texture_binding(),
            resource: wgpu::BindingResource::TextureView(&texture.view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: slot.sampler_binding(),
            resource: wgpu::BindingResource::Sampler(&texture.sampler),
        });
    }
    entries
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let attributes = [
        wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: POSITION_LOCATION,
        },
        wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: GeometryBuffers::tex_coord_offset(),
            shader_location: TEX_COORD_LOCATION,
        },
    ];
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("shadercam pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("main"),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: GeometryBuffers::vertex_stride(),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// The shared quad uploaded once per context.
pub(crate) struct GeometryGpu {
    pub vertices: wgpu::Buffer,
    pub indices: wgpu::Buffer,
    pub index_count: u32,
}

impl GeometryGpu {
    pub fn upload(device: &wgpu::Device, geometry: &GeometryBuffers) -> Self {
        let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad vertices"),
            contents: geometry.vertex_bytes(),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad indices"),
            contents: geometry.index_bytes(),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertices,
            indices,
            index_count: geometry.index_count(),
        }
    }
}
