//! Pipelined GPU to host readback of the output texture.
//!
//! A ring of `N` transfer buffers, each guarded by a fence. Every call copies
//! the current output into the next buffer and reads back the oldest buffer
//! whose copy has completed, so rendering never waits on the transfer:
//!
//! ```text
//!  call k:   submit ─▶ [slot k % N]        read ◀─ [oldest signaled slot]
//! ```
//!
//! The returned image lags the GPU by at most `N - 1` frames. A buffer is only
//! mapped after its fence has signaled; the single blocking point is waiting on
//! a fence when the ring is about to overrun (or on the very first frame).

use image::RgbaImage;

use crate::error::{GpuError, GpuResult};
use crate::gpu::{GpuBackend, PixelFormat, RawBuffer, RawFence};
use crate::texture::{TextureHandle, TextureManager};

const BLACK: image::Rgba<u8> = image::Rgba([0, 0, 0, 255]);

#[derive(Default)]
struct Slot {
    buffer: Option<RawBuffer>,
    /// Set while the slot holds a copy that has not been read back.
    fence: Option<RawFence>,
}

pub struct Readback {
    slots: Vec<Slot>,
    size: (u32, u32),
    submit_index: usize,
    read_index: usize,
    in_flight: usize,
    scratch: Option<TextureHandle>,
    last: Option<RgbaImage>,
    staging: Vec<u8>,
}

impl Readback {
    pub fn new(buffers: usize) -> Self {
        Self {
            slots: (0..buffers.max(2)).map(|_| Slot::default()).collect(),
            size: (0, 0),
            submit_index: 0,
            read_index: 0,
            in_flight: 0,
            scratch: None,
            last: None,
            staging: Vec::new(),
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    /// Copies submitted but not yet read back.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Submit the current contents of `output` and return the freshest
    /// completed frame. No output (or an unallocated one) reads as opaque black.
    pub fn read(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        output: Option<TextureHandle>,
    ) -> GpuResult<RgbaImage> {
        let (width, height) = (textures.config().width, textures.config().height);
        let Some(output) = output.filter(|&h| textures.raw(h).is_some()) else {
            return Ok(RgbaImage::from_pixel(width, height, BLACK));
        };
        let Some(source) = self.host_readable(gpu, textures, output)? else {
            return Ok(RgbaImage::from_pixel(width, height, BLACK));
        };
        let size = textures.size(source).unwrap_or((width, height));
        self.ensure_buffers(gpu, size)?;

        self.submit(gpu, textures, source)?;

        let n = self.slots.len();
        loop {
            let Some(fence) = self.slots[self.read_index].fence else {
                break;
            };
            let must_read = self.in_flight >= n - 1 || self.last.is_none();
            if !must_read && !gpu.fence_signaled(fence) {
                break;
            }
            self.read_oldest(gpu)?;
        }

        match &self.last {
            Some(img) => Ok(img.clone()),
            None => Ok(RgbaImage::from_pixel(width, height, BLACK)),
        }
    }

    /// Synchronous single-pixel read of `output`. Blocks on the GPU.
    pub fn sample_pixel(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        output: Option<TextureHandle>,
        x: u32,
        y: u32,
    ) -> GpuResult<[u8; 4]> {
        let Some(output) = output.filter(|&h| textures.raw(h).is_some()) else {
            return Ok(BLACK.0);
        };
        match self.host_readable(gpu, textures, output)? {
            Some(source) => match textures.raw(source) {
                Some(raw) => gpu.read_pixel(raw, x, y),
                None => Ok(BLACK.0),
            },
            None => Ok(BLACK.0),
        }
    }

    /// `output` itself if it is RGBA8, otherwise the scratch texture after
    /// converting into it.
    fn host_readable(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        output: TextureHandle,
    ) -> GpuResult<Option<TextureHandle>> {
        if textures.format(output).is_some_and(PixelFormat::is_host_readable) {
            return Ok(Some(output));
        }
        let scratch = *self.scratch.get_or_insert_with(|| {
            textures.create_texture_with_format(gpu, "readback scratch", PixelFormat::Rgba8Unorm)
        });
        if textures.raw(scratch).is_none() {
            return Ok(None);
        }
        textures.blit(gpu, output, scratch)?;
        Ok(Some(scratch))
    }

    fn submit(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
        source: TextureHandle,
    ) -> GpuResult<()> {
        if self.slots[self.submit_index].fence.is_some() {
            // Ring overrun: drain the oldest copy before reusing its buffer.
            self.read_oldest(gpu)?;
        }
        let slot = &mut self.slots[self.submit_index];
        let (Some(buffer), Some(raw)) = (slot.buffer, textures.raw(source)) else {
            return Ok(());
        };
        gpu.copy_to_buffer(raw, buffer)?;
        slot.fence = Some(gpu.insert_fence()?);
        self.submit_index = (self.submit_index + 1) % self.slots.len();
        self.in_flight += 1;
        Ok(())
    }

    fn read_oldest(&mut self, gpu: &mut dyn GpuBackend) -> GpuResult<()> {
        let slot = &mut self.slots[self.read_index];
        let (Some(fence), Some(buffer)) = (slot.fence.take(), slot.buffer) else {
            return Ok(());
        };
        gpu.wait_fence(fence)?;
        gpu.read_buffer(buffer, &mut self.staging)?;
        self.read_index = (self.read_index + 1) % self.slots.len();
        self.in_flight -= 1;

        let (width, height) = self.size;
        let pixels = std::mem::take(&mut self.staging);
        let img = RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            GpuError::FormatMismatch(format!("readback buffer does not hold a {width}x{height} image"))
        })?;
        if let Some(previous) = self.last.replace(img) {
            self.staging = previous.into_raw();
        }
        Ok(())
    }

    fn ensure_buffers(&mut self, gpu: &mut dyn GpuBackend, size: (u32, u32)) -> GpuResult<()> {
        if self.size == size && self.slots.iter().all(|slot| slot.buffer.is_some()) {
            return Ok(());
        }
        self.release(gpu)?;
        for slot in &mut self.slots {
            slot.buffer = Some(gpu.create_readback_buffer(size.0, size.1)?);
        }
        self.size = size;
        tracing::debug!(width = size.0, height = size.1, buffers = self.slots.len(), "readback buffers allocated");
        Ok(())
    }

    /// Wait out every pending copy and free the buffers.
    fn release(&mut self, gpu: &mut dyn GpuBackend) -> GpuResult<()> {
        for slot in &mut self.slots {
            if let Some(fence) = slot.fence.take() {
                gpu.wait_fence(fence)?;
            }
            if let Some(buffer) = slot.buffer.take() {
                gpu.destroy_buffer(buffer);
            }
        }
        self.submit_index = 0;
        self.read_index = 0;
        self.in_flight = 0;
        self.last = None;
        Ok(())
    }

    /// Drop buffered frames, e.g. after the output changes size.
    pub fn reset(&mut self, gpu: &mut dyn GpuBackend) -> GpuResult<()> {
        self.release(gpu)?;
        self.size = (0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderingConfig;
    use crate::gpu::SoftwareBackend;

    fn setup(latency: u64) -> (SoftwareBackend, TextureManager, TextureHandle) {
        let mut gpu = SoftwareBackend::new().with_fence_latency(latency);
        let mut textures = TextureManager::new(RenderingConfig::new().size(2, 2));
        let out = textures.create_texture(&mut gpu, "out");
        (gpu, textures, out)
    }

    #[test]
    fn first_read_blocks_for_the_frame() {
        let (mut gpu, mut textures, out) = setup(4);
        textures.fill(&mut gpu, out, [1.0, 0.0, 0.0, 1.0]).unwrap();
        let mut readback = Readback::new(3);

        let img = readback.read(&mut gpu, &mut textures, Some(out)).unwrap();

        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(gpu.stats().blocking_waits, 1);
        assert_eq!(gpu.stats().torn_reads, 0);
    }

    #[test]
    fn missing_output_reads_black() {
        let (mut gpu, mut textures, _) = setup(1);
        let mut readback = Readback::new(3);
        let img = readback.read(&mut gpu, &mut textures, None).unwrap();
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0, 255]));
        assert_eq!(gpu.stats().copies, 0);
    }

    #[test]
    fn float_output_goes_through_scratch() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = TextureManager::new(
            RenderingConfig::new()
                .size(2, 2)
                .format(PixelFormat::Rgba16Float),
        );
        let out = textures.create_texture(&mut gpu, "out");
        textures.fill(&mut gpu, out, [0.0, 1.0, 0.0, 1.0]).unwrap();
        let mut readback = Readback::new(3);

        let img = readback.read(&mut gpu, &mut textures, Some(out)).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [0, 255, 0, 255]);
        assert_eq!(
            readback.sample_pixel(&mut gpu, &mut textures, Some(out), 0, 0).unwrap(),
            [0, 255, 0, 255]
        );
    }
}
