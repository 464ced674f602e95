//! Graph sources.
//!
//! A [`Seed`] owns one texture at the working resolution and fills it from one
//! of four generators. Random seeds regenerate after every tick unless they are
//! fixed; image and camera seeds change only when new pixels arrive.

use std::path::{Path, PathBuf};

use image::{RgbaImage, imageops};

use crate::error::GpuResult;
use crate::gpu::GpuBackend;
use crate::texture::{TextureHandle, TextureManager};

#[derive(Clone, Debug)]
pub enum SeedKind {
    /// Per-pixel random RGB, opaque.
    ColorNoise,
    /// Per-pixel random luminance, opaque.
    GrayscaleNoise,
    /// A still image, letterboxed to the working resolution.
    Image(RgbaImage),
    /// Frames pushed by a capture device.
    Camera,
}

impl SeedKind {
    pub fn name(&self) -> &'static str {
        match self {
            SeedKind::ColorNoise => "color noise",
            SeedKind::GrayscaleNoise => "grayscale noise",
            SeedKind::Image(_) => "image",
            SeedKind::Camera => "camera",
        }
    }
}

pub struct Seed {
    kind: SeedKind,
    fixed: bool,
    texture: TextureHandle,
    generation: u32,
    pending_frame: Option<RgbaImage>,
    /// File an image seed was loaded from, kept for snapshots.
    path: Option<PathBuf>,
}

impl Seed {
    pub(crate) fn new(
        gpu: &mut dyn GpuBackend,
        textures: &mut TextureManager,
        kind: SeedKind,
        fixed: bool,
    ) -> Self {
        let texture = textures.create_texture(gpu, &format!("{} seed", kind.name()));
        let mut seed = Self {
            kind,
            fixed,
            texture,
            generation: 0,
            pending_frame: None,
            path: None,
        };
        if let Err(err) = seed.fill(gpu, textures) {
            tracing::warn!(%err, "initial seed fill failed");
        }
        seed
    }

    pub fn kind(&self) -> &SeedKind {
        &self.kind
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub(crate) fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Queue a captured frame. Only the latest queued frame is uploaded.
    pub(crate) fn push_frame(&mut self, frame: RgbaImage) -> bool {
        if !matches!(self.kind, SeedKind::Camera) {
            return false;
        }
        self.pending_frame = Some(frame);
        true
    }

    /// Upload a pending camera frame, if any.
    pub(crate) fn apply_pending(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
    ) -> GpuResult<bool> {
        let Some(frame) = self.pending_frame.take() else {
            return Ok(false);
        };
        self.upload(gpu, textures, &frame)?;
        Ok(true)
    }

    /// Post-tick update: random seeds draw a new field unless fixed.
    pub(crate) fn advance(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
    ) -> GpuResult<()> {
        if self.fixed || !self.is_random() {
            return Ok(());
        }
        self.generation = self.generation.wrapping_add(1);
        self.fill(gpu, textures)
    }

    fn is_random(&self) -> bool {
        matches!(self.kind, SeedKind::ColorNoise | SeedKind::GrayscaleNoise)
    }

    /// Generate the texture contents from scratch.
    pub(crate) fn fill(
        &mut self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
    ) -> GpuResult<()> {
        let (width, height) = (textures.config().width, textures.config().height);
        match &self.kind {
            SeedKind::ColorNoise => {
                let img = noise(width, height, self.generation, false);
                self.upload(gpu, textures, &img)
            }
            SeedKind::GrayscaleNoise => {
                let img = noise(width, height, self.generation, true);
                self.upload(gpu, textures, &img)
            }
            SeedKind::Image(source) => {
                let img = letterbox(source, width, height);
                self.upload(gpu, textures, &img)
            }
            SeedKind::Camera => textures.clear(gpu, self.texture),
        }
    }

    fn upload(
        &self,
        gpu: &mut dyn GpuBackend,
        textures: &TextureManager,
        img: &RgbaImage,
    ) -> GpuResult<()> {
        let Some(raw) = textures.raw(self.texture) else {
            return Ok(());
        };
        let (width, height) = textures.size(self.texture).unwrap_or(img.dimensions());
        if img.dimensions() == (width, height) {
            gpu.upload_rgba8(raw, 0, img.as_raw())
        } else {
            gpu.upload_rgba8(raw, 0, letterbox(img, width, height).as_raw())
        }
    }

    pub(crate) fn destroy(self, gpu: &mut dyn GpuBackend, textures: &mut TextureManager) {
        textures.destroy(gpu, self.texture);
    }
}

/// Scale `img` to fit inside `width`x`height` keeping its aspect ratio, centered
/// on opaque black.
pub fn letterbox(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (src_w, src_h) = img.dimensions();
    if (src_w, src_h) == (width, height) {
        return img.clone();
    }
    let mut canvas = RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
    if src_w == 0 || src_h == 0 {
        return canvas;
    }
    let scale = f64::min(width as f64 / src_w as f64, height as f64 / src_h as f64);
    let fit_w = ((src_w as f64 * scale).round() as u32).clamp(1, width);
    let fit_h = ((src_h as f64 * scale).round() as u32).clamp(1, height);
    let scaled = imageops::resize(img, fit_w, fit_h, imageops::FilterType::Triangle);
    let x = (width - fit_w) / 2;
    let y = (height - fit_h) / 2;
    imageops::overlay(&mut canvas, &scaled, x as i64, y as i64);
    canvas
}

fn noise(width: u32, height: u32, generation: u32, grayscale: bool) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let h = hash(x, y, generation);
        if grayscale {
            let v = (h & 0xff) as u8;
            image::Rgba([v, v, v, 255])
        } else {
            image::Rgba([h as u8, (h >> 8) as u8, (h >> 16) as u8, 255])
        }
    })
}

fn hash(x: u32, y: u32, seed: u32) -> u32 {
    let mut h = seed.wrapping_mul(2654435761);
    h = h.wrapping_add(x.wrapping_mul(374761393));
    h = h.wrapping_add(y.wrapping_mul(668265263));
    h ^= h >> 13;
    h = h.wrapping_mul(1274126177);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_centers_wide_image() {
        let img = RgbaImage::from_pixel(4, 2, image::Rgba([255, 255, 255, 255]));
        let boxed = letterbox(&img, 4, 4);
        assert_eq!(boxed.dimensions(), (4, 4));
        assert_eq!(boxed.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(boxed.get_pixel(0, 1).0, [255, 255, 255, 255]);
        assert_eq!(boxed.get_pixel(3, 2).0, [255, 255, 255, 255]);
        assert_eq!(boxed.get_pixel(3, 3).0, [0, 0, 0, 255]);
    }

    #[test]
    fn grayscale_noise_has_equal_channels() {
        let img = noise(8, 8, 3, true);
        assert!(img.pixels().all(|p| p[0] == p[1] && p[1] == p[2] && p[3] == 255));
    }

    #[test]
    fn noise_changes_between_generations() {
        assert_ne!(noise(8, 8, 0, false), noise(8, 8, 1, false));
    }
}
