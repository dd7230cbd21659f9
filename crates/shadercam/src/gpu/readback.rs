use anyhow::{anyhow, Context, Result};

const BYTES_PER_PIXEL: u32 = 4;

/// Staging buffer reused across frames to copy a render target back to the CPU.
pub(crate) struct Readback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
    pixels: Vec<u8>,
}

/// Row pitch satisfying `COPY_BYTES_PER_ROW_ALIGNMENT`.
pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

impl Readback {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let padded_row = padded_bytes_per_row(width);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("recording readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            width,
            height,
            padded_row,
            pixels: vec![0; (width * height * BYTES_PER_PIXEL) as usize],
        }
    }

    /// Copies `texture` into the staging buffer, waits for the GPU and returns tightly packed RGBA.
    pub fn read(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        texture: &wgpu::Texture,
    ) -> Result<&[u8]> {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("recording readback encoder"),
        });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(std::iter::once(encoder.finish()));

        let slice = self.buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| anyhow!("device poll failed: {err}"))?;
        rx.recv()
            .context("readback callback dropped")?
            .map_err(|err| anyhow!("failed to map readback buffer: {err}"))?;

        {
            let mapped = slice.get_mapped_range();
            let row = (self.width * BYTES_PER_PIXEL) as usize;
            for (y, chunk) in self.pixels.chunks_exact_mut(row).enumerate() {
                let start = y * self.padded_row as usize;
                chunk.copy_from_slice(&mapped[start..start + row]);
            }
        }
        self.buffer.unmap();
        Ok(&self.pixels)
    }
}
