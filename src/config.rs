//! Rendering configuration shared by every texture the engine owns.
//!
//! The working resolution and pixel format are process-wide in spirit: every
//! operation and seed renders at the same size and precision. They are carried
//! here as an explicit value handed to the [`TextureManager`](crate::TextureManager)
//! and changed only through [`Engine::resize`](crate::Engine::resize) and
//! [`Engine::set_format`](crate::Engine::set_format).

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::gpu::{FilterMode, PixelFormat};

/// Upper bound on layers in the shared blend texture. Fixed by the size of the
/// weight array in the blend uniform block.
pub const MAX_BLEND_LAYERS: u32 = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingConfig {
    /// Working width in pixels.
    pub width: u32,
    /// Working height in pixels.
    pub height: u32,
    /// Storage format of every render target.
    pub format: PixelFormat,
    /// Layer count of the shared blend texture. Inputs beyond this are dropped.
    pub max_blend_layers: u32,
    /// Number of in-flight readback buffers.
    pub readback_buffers: usize,
    /// Sampler filter for operations that do not pick one.
    pub default_filter: FilterMode,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Rgba8Unorm,
            max_blend_layers: 8,
            readback_buffers: 3,
            default_filter: FilterMode::Linear,
        }
    }
}

impl RenderingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn max_blend_layers(mut self, layers: u32) -> Self {
        self.max_blend_layers = layers;
        self
    }

    pub fn readback_buffers(mut self, count: usize) -> Self {
        self.readback_buffers = count;
        self
    }

    pub fn default_filter(mut self, filter: FilterMode) -> Self {
        self.default_filter = filter;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> FeedResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FeedResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FeedError::config(format!(
                "resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.max_blend_layers == 0 || self.max_blend_layers > MAX_BLEND_LAYERS {
            return Err(FeedError::config(format!(
                "max_blend_layers must be in 1..={MAX_BLEND_LAYERS}, got {}",
                self.max_blend_layers
            )));
        }
        if self.readback_buffers < 2 {
            return Err(FeedError::config(format!(
                "readback_buffers must be at least 2, got {}",
                self.readback_buffers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.readback_buffers, 3);
    }

    #[test]
    fn builder_overrides() {
        let config = RenderingConfig::new()
            .size(1280, 720)
            .format(PixelFormat::Rgba16Float)
            .max_blend_layers(4);
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.format, PixelFormat::Rgba16Float);
        assert_eq!(config.max_blend_layers, 4);
    }

    #[test]
    fn rejects_degenerate_values() {
        assert!(RenderingConfig::new().size(0, 10).validate().is_err());
        assert!(RenderingConfig::new().max_blend_layers(0).validate().is_err());
        assert!(
            RenderingConfig::new()
                .max_blend_layers(MAX_BLEND_LAYERS + 1)
                .validate()
                .is_err()
        );
        assert!(RenderingConfig::new().readback_buffers(1).validate().is_err());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config =
            RenderingConfig::from_json(r#"{ "width": 320, "height": 200, "format": "rgba16_float" }"#)
                .unwrap();
        assert_eq!(config.width, 320);
        assert_eq!(config.format, PixelFormat::Rgba16Float);
        assert_eq!(config.max_blend_layers, 8);
    }
}
