use wgpu::util::{DeviceExt, TextureDataOrder};

use crate::types::{LoadedTexture, MAX_TEXTURES};

pub(crate) const SAMPLED_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// A sampled 2D texture with its view and sampler.
pub(crate) struct SampledTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub size: (u32, u32),
}

impl SampledTexture {
    pub fn with_data(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        label: &str,
        size: (u32, u32),
        data: &[u8],
    ) -> Self {
        let texture = device.create_texture_with_data(
            queue,
            &wgpu::TextureDescriptor {
                label: Some(label),
                size: extent(size),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: SAMPLED_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            TextureDataOrder::LayerMajor,
            data,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(label),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self {
            texture,
            view,
            sampler,
            size,
        }
    }

    /// Opaque black 1x1 stand-in for textures that have not been uploaded yet.
    pub fn placeholder(device: &wgpu::Device, queue: &wgpu::Queue, label: &str) -> Self {
        Self::with_data(device, queue, label, (1, 1), &[0, 0, 0, 255])
    }

    fn write(&self, queue: &wgpu::Queue, data: &[u8]) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.size.0 * 4),
                rows_per_image: Some(self.size.1),
            },
            extent(self.size),
        );
    }
}

pub(crate) fn extent(size: (u32, u32)) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.0.max(1),
        height: size.1.max(1),
        depth_or_array_layers: 1,
    }
}

/// The camera texture plus user textures, with a generation counter bumped
/// whenever a bind group referencing them must be rebuilt.
pub(crate) struct TextureSet {
    pub camera: SampledTexture,
    slots: Vec<Option<SampledTexture>>,
    placeholder: SampledTexture,
    generation: u64,
}

impl TextureSet {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        Self {
            camera: SampledTexture::placeholder(device, queue, "camera texture"),
            slots: (0..MAX_TEXTURES).map(|_| None).collect(),
            placeholder: SampledTexture::placeholder(device, queue, "slot placeholder"),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Writes a camera image, recreating the texture when its size changes.
    pub fn update_camera(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        size: (u32, u32),
        pixels: &[u8],
    ) {
        if self.camera.size == size {
            self.camera.write(queue, pixels);
            return;
        }
        tracing::debug!(
            from = ?self.camera.size,
            to = ?size,
            "camera texture resized"
        );
        self.camera = SampledTexture::with_data(device, queue, "camera texture", size, pixels);
        self.generation += 1;
    }

    pub fn upload_slot(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, texture: &LoadedTexture) {
        let index = texture.slot.index;
        let size = texture.image.dimensions();
        let label = format!("user texture #{index} ({})", texture.slot.uniform_name);
        let uploaded = SampledTexture::with_data(device, queue, &label, size, texture.image.as_raw());
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(uploaded);
            self.generation += 1;
        }
    }

    /// Texture bound to slot `index`, or the placeholder when nothing was uploaded.
    pub fn slot(&self, index: usize) -> &SampledTexture {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .unwrap_or(&self.placeholder)
    }
}
