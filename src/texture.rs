//! Texture resource manager.
//!
//! Every render target the engine uses is owned here and addressed through a
//! stable [`TextureHandle`]. The handle maps through a table onto the backend's
//! current [`RawTexture`]; resizing or switching pixel format allocates a new
//! native texture, blits the old contents into it and swaps the table entry, so
//! anything holding a handle (edges, the output selection, readback) always
//! resolves to the live resource.
//!
//! ```text
//!  TextureHandle(3) ──▶ table ──▶ RawTexture(17)      before resize
//!  TextureHandle(3) ──▶ table ──▶ RawTexture(42)      after resize (17 blitted in, freed)
//! ```
//!
//! Allocation failures are logged and never abort the pipeline: a handle whose
//! allocation failed resolves to `None` and consumers treat it as black.

use std::collections::BTreeMap;

use glam::Mat4;

use crate::config::RenderingConfig;
use crate::error::GpuResult;
use crate::gpu::{GpuBackend, PixelFormat, RawTexture, TextureDesc};

/// Stable, copyable reference to a texture owned by the [`TextureManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(u32);

/// Aspect-correct orthographic bounds. The shorter axis spans `[-1, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrthoBounds {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
}

impl OrthoBounds {
    pub fn for_size(width: u32, height: u32) -> Self {
        let aspect = width as f32 / height.max(1) as f32;
        if aspect >= 1.0 {
            Self {
                left: -aspect,
                right: aspect,
                bottom: -1.0,
                top: 1.0,
            }
        } else {
            Self {
                left: -1.0,
                right: 1.0,
                bottom: -1.0 / aspect,
                top: 1.0 / aspect,
            }
        }
    }

    /// Projection matrix operations upload in their uniform header.
    pub fn projection(&self) -> Mat4 {
        Mat4::orthographic_rh(self.left, self.right, self.bottom, self.top, -1.0, 1.0)
    }
}

struct TextureSlot {
    label: String,
    raw: Option<RawTexture>,
    layers: u32,
    layered: bool,
    /// Fixed format that ignores [`TextureManager::set_format`], used by scratch
    /// targets that must stay host-readable.
    pinned: Option<PixelFormat>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

pub struct TextureManager {
    config: RenderingConfig,
    slots: BTreeMap<TextureHandle, TextureSlot>,
    next: u32,
    bounds: OrthoBounds,
}

impl TextureManager {
    pub fn new(config: RenderingConfig) -> Self {
        let bounds = OrthoBounds::for_size(config.width, config.height);
        Self {
            config,
            slots: BTreeMap::new(),
            next: 0,
            bounds,
        }
    }

    pub fn config(&self) -> &RenderingConfig {
        &self.config
    }

    pub fn bounds(&self) -> OrthoBounds {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocate a 2D render target at the working size and format, cleared to zero.
    pub fn create_texture(&mut self, gpu: &mut dyn GpuBackend, label: &str) -> TextureHandle {
        self.insert(gpu, label, 1, false, None)
    }

    /// Allocate a layered texture with `depth` layers, every layer cleared.
    pub fn create_array_texture(
        &mut self,
        gpu: &mut dyn GpuBackend,
        label: &str,
        depth: u32,
    ) -> TextureHandle {
        self.insert(gpu, label, depth.max(1), true, None)
    }

    /// Allocate a 2D target whose format never follows [`set_format`](Self::set_format).
    pub fn create_texture_with_format(
        &mut self,
        gpu: &mut dyn GpuBackend,
        label: &str,
        format: PixelFormat,
    ) -> TextureHandle {
        self.insert(gpu, label, 1, false, Some(format))
    }

    fn insert(
        &mut self,
        gpu: &mut dyn GpuBackend,
        label: &str,
        layers: u32,
        layered: bool,
        pinned: Option<PixelFormat>,
    ) -> TextureHandle {
        let handle = TextureHandle(self.next);
        self.next += 1;

        let format = pinned.unwrap_or(self.config.format);
        let mut slot = TextureSlot {
            label: label.to_string(),
            raw: None,
            layers,
            layered,
            pinned,
            width: self.config.width,
            height: self.config.height,
            format,
        };
        slot.raw = allocate(gpu, &slot, self.config.width, self.config.height, format);
        if let Some(raw) = slot.raw {
            for layer in 0..layers {
                log_failure(&slot.label, gpu.clear(raw, layer, [0.0; 4]));
            }
        }
        tracing::debug!(?handle, label, layers, ?format, "texture created");
        self.slots.insert(handle, slot);
        handle
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend, handle: TextureHandle) {
        if let Some(slot) = self.slots.remove(&handle) {
            if let Some(raw) = slot.raw {
                gpu.destroy_texture(raw);
            }
            tracing::debug!(?handle, label = %slot.label, "texture destroyed");
        }
    }

    /// Resolve a handle to the current native texture.
    pub fn raw(&self, handle: TextureHandle) -> Option<RawTexture> {
        self.slots.get(&handle).and_then(|slot| slot.raw)
    }

    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    pub fn layers(&self, handle: TextureHandle) -> u32 {
        self.slots.get(&handle).map_or(0, |slot| slot.layers)
    }

    pub fn format(&self, handle: TextureHandle) -> Option<PixelFormat> {
        self.slots.get(&handle).map(|slot| slot.format)
    }

    pub fn size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.slots.get(&handle).map(|slot| (slot.width, slot.height))
    }

    pub fn clear(&self, gpu: &mut dyn GpuBackend, handle: TextureHandle) -> GpuResult<()> {
        self.fill(gpu, handle, [0.0; 4])
    }

    /// Fill every layer of `handle` with `color`.
    pub fn fill(
        &self,
        gpu: &mut dyn GpuBackend,
        handle: TextureHandle,
        color: [f32; 4],
    ) -> GpuResult<()> {
        let Some(slot) = self.slots.get(&handle) else {
            return Ok(());
        };
        if let Some(raw) = slot.raw {
            for layer in 0..slot.layers {
                gpu.clear(raw, layer, color)?;
            }
        }
        Ok(())
    }

    pub fn clear_array_layer(
        &self,
        gpu: &mut dyn GpuBackend,
        handle: TextureHandle,
        layer: u32,
    ) -> GpuResult<()> {
        match self.raw(handle) {
            Some(raw) if layer < self.layers(handle) => gpu.clear(raw, layer, [0.0; 4]),
            _ => Ok(()),
        }
    }

    /// Copy layer 0 of `src` into layer 0 of `dst`. A null side is a no-op.
    pub fn blit(
        &self,
        gpu: &mut dyn GpuBackend,
        src: TextureHandle,
        dst: TextureHandle,
    ) -> GpuResult<()> {
        self.copy_to_layer(gpu, src, dst, 0)
    }

    /// Copy layer 0 of `src` into `layer` of `dst`.
    pub fn copy_to_layer(
        &self,
        gpu: &mut dyn GpuBackend,
        src: TextureHandle,
        dst: TextureHandle,
        layer: u32,
    ) -> GpuResult<()> {
        match (self.raw(src), self.raw(dst)) {
            (Some(s), Some(d)) => gpu.blit(s, 0, d, layer),
            _ => Ok(()),
        }
    }

    /// Copy one layer of a layered texture onto another layer of the same texture.
    pub fn copy_layer(
        &self,
        gpu: &mut dyn GpuBackend,
        handle: TextureHandle,
        from: u32,
        to: u32,
    ) -> GpuResult<()> {
        match self.raw(handle) {
            Some(raw) => gpu.blit(raw, from, raw, to),
            None => Ok(()),
        }
    }

    /// Reallocate every texture at `width`x`height`, carrying contents across with
    /// a nearest-neighbor blit. Returns the new orthographic bounds, which the
    /// caller pushes to every operation.
    #[tracing::instrument(skip(self, gpu))]
    pub fn resize(&mut self, gpu: &mut dyn GpuBackend, width: u32, height: u32) -> OrthoBounds {
        if width == 0 || height == 0 {
            tracing::warn!("ignoring zero-sized resize");
            return self.bounds;
        }
        self.config.width = width;
        self.config.height = height;
        for slot in self.slots.values_mut() {
            swap_via_blit(gpu, slot, width, height, slot.format);
        }
        self.bounds = OrthoBounds::for_size(width, height);
        tracing::info!(textures = self.slots.len(), "textures resized");
        self.bounds
    }

    /// Reallocate every unpinned texture in `format`, preserving contents.
    #[tracing::instrument(skip(self, gpu))]
    pub fn set_format(&mut self, gpu: &mut dyn GpuBackend, format: PixelFormat) {
        self.config.format = format;
        let (width, height) = (self.config.width, self.config.height);
        for slot in self.slots.values_mut() {
            if slot.pinned.is_none() {
                swap_via_blit(gpu, slot, width, height, format);
            }
        }
        tracing::info!(textures = self.slots.len(), "texture format changed");
    }
}

fn allocate(
    gpu: &mut dyn GpuBackend,
    slot: &TextureSlot,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Option<RawTexture> {
    let desc = TextureDesc {
        label: &slot.label,
        width,
        height,
        layers: slot.layers,
        layered: slot.layered,
        format,
    };
    match gpu.create_texture(&desc) {
        Ok(raw) => Some(raw),
        Err(err) => {
            tracing::warn!(label = %slot.label, %err, "texture allocation failed");
            None
        }
    }
}

fn swap_via_blit(
    gpu: &mut dyn GpuBackend,
    slot: &mut TextureSlot,
    width: u32,
    height: u32,
    format: PixelFormat,
) {
    if slot.raw.is_some() && (slot.width, slot.height, slot.format) == (width, height, format) {
        return;
    }
    let Some(new) = allocate(gpu, slot, width, height, format) else {
        // Keep serving the old resource; it is stale in size but still valid.
        return;
    };
    match slot.raw {
        Some(old) => {
            for layer in 0..slot.layers {
                log_failure(&slot.label, gpu.blit(old, layer, new, layer));
            }
            gpu.destroy_texture(old);
        }
        None => {
            for layer in 0..slot.layers {
                log_failure(&slot.label, gpu.clear(new, layer, [0.0; 4]));
            }
        }
    }
    slot.raw = Some(new);
    slot.width = width;
    slot.height = height;
    slot.format = format;
}

fn log_failure(label: &str, result: GpuResult<()>) {
    if let Err(err) = result {
        tracing::warn!(label, %err, "texture operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn manager(width: u32, height: u32) -> TextureManager {
        TextureManager::new(RenderingConfig::new().size(width, height))
    }

    #[test]
    fn bounds_keep_short_axis_unit() {
        let wide = OrthoBounds::for_size(200, 100);
        assert_eq!((wide.left, wide.right, wide.bottom, wide.top), (-2.0, 2.0, -1.0, 1.0));
        let tall = OrthoBounds::for_size(100, 200);
        assert_eq!((tall.left, tall.right, tall.bottom, tall.top), (-1.0, 1.0, -2.0, 2.0));
    }

    #[test]
    fn resize_swaps_raw_but_keeps_handle() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = manager(4, 4);
        let handle = textures.create_texture(&mut gpu, "out");
        let before = textures.raw(handle).unwrap();

        let bounds = textures.resize(&mut gpu, 8, 4);
        let after = textures.raw(handle).unwrap();

        assert_ne!(before, after);
        assert_eq!(gpu.texture_size(after), Some((8, 4, 1)));
        assert_eq!(gpu.texture_size(before), None);
        assert_eq!(bounds.right, 2.0);
    }

    #[test]
    fn pinned_textures_ignore_format_changes() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = manager(2, 2);
        let scratch =
            textures.create_texture_with_format(&mut gpu, "scratch", PixelFormat::Rgba8Unorm);
        let target = textures.create_texture(&mut gpu, "target");

        textures.set_format(&mut gpu, PixelFormat::Rgba16Float);

        assert_eq!(textures.format(scratch), Some(PixelFormat::Rgba8Unorm));
        assert_eq!(textures.format(target), Some(PixelFormat::Rgba16Float));
    }

    #[test]
    fn failed_allocation_yields_null_handle() {
        let mut gpu = SoftwareBackend::new().with_texture_limit(1);
        let mut textures = manager(2, 2);
        let first = textures.create_texture(&mut gpu, "a");
        let second = textures.create_texture(&mut gpu, "b");
        assert!(textures.raw(first).is_some());
        assert!(textures.raw(second).is_none());
        assert!(textures.contains(second));
        // Blits against a null handle are silently skipped.
        assert!(textures.blit(&mut gpu, first, second).is_ok());
    }

    #[test]
    fn array_textures_copy_between_layers() {
        let mut gpu = SoftwareBackend::new();
        let mut textures = manager(2, 2);
        let history = textures.create_array_texture(&mut gpu, "history", 3);
        let raw = textures.raw(history).unwrap();
        gpu.clear(raw, 0, [1.0, 0.0, 0.0, 1.0]).unwrap();

        textures.copy_layer(&mut gpu, history, 0, 2).unwrap();
        textures.clear_array_layer(&mut gpu, history, 0).unwrap();

        assert_eq!(gpu.texels(raw, 2).unwrap()[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(gpu.texels(raw, 0).unwrap()[0], [0.0; 4]);
    }
}
