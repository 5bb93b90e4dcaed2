pub mod capture;
pub mod encode;
pub mod pacer;
pub mod process;

/// Hard ceiling on the frame rate any session may request
pub const MAX_FPS: u32 = 60;
/// Frame rate used when the viewer doesn't ask for one
pub const DEFAULT_FPS: u32 = 30;
/// Default max resolution. Requests are clamped to the configured maxima.
pub const DEFAULT_MAX_WIDTH: u32 = 1280;
pub const DEFAULT_MAX_HEIGHT: u32 = 720;
/// JPEG quality (1-100). Higher = sharper, more bandwidth.
pub const DEFAULT_QUALITY: u32 = 60;

/// Byte layout of a pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// What the platform grabbers hand out. Rows may be padded.
    Bgra8,
    /// Tightly packed, what both encoders consume
    Rgb8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Bgra8 => 4,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// One snapshot of a monitor (or the processed version of it)
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, >= width * bytes_per_pixel
    pub stride: usize,
    pub data: Vec<u8>,
    pub layout: PixelLayout,
}

impl RawFrame {
    /// Packed frame (stride == width * bpp)
    pub fn packed(width: u32, height: u32, data: Vec<u8>, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            stride: width as usize * layout.bytes_per_pixel(),
            data,
            layout,
        }
    }
}

/// Per-stream output settings after clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
}

/// Server-wide limits and defaults applied to every stream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub default_fps: u32,
    pub default_quality: u32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            default_fps: DEFAULT_FPS,
            default_quality: DEFAULT_QUALITY,
        }
    }
}

impl StreamLimits {
    /// Fill in defaults and clamp a viewer's request
    pub fn resolve(
        &self,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<u32>,
        quality: Option<u32>,
    ) -> StreamConfig {
        StreamConfig {
            width: width.unwrap_or(self.max_width).clamp(1, self.max_width),
            height: height.unwrap_or(self.max_height).clamp(1, self.max_height),
            fps: clamp_fps(fps.unwrap_or(self.default_fps)),
            quality: clamp_quality(quality.unwrap_or(self.default_quality)),
        }
    }
}

pub fn clamp_fps(fps: u32) -> u32 {
    fps.clamp(1, MAX_FPS)
}

pub fn clamp_quality(quality: u32) -> u32 {
    quality.clamp(1, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_is_clamped_to_range() {
        for requested in [0u32, 1, 10, 59, 60, 61, 240, u32::MAX] {
            assert_eq!(clamp_fps(requested), requested.min(60).max(1));
        }
    }

    #[test]
    fn test_resolve_applies_defaults_and_maxima() {
        let limits = StreamLimits::default();
        let cfg = limits.resolve(None, None, None, None);
        assert_eq!(
            cfg,
            StreamConfig { width: 1280, height: 720, fps: 30, quality: 60 }
        );

        let cfg = limits.resolve(Some(3840), Some(2160), Some(120), Some(0));
        assert_eq!(cfg.width, 1280);
        assert_eq!(cfg.height, 720);
        assert_eq!(cfg.fps, 60);
        assert_eq!(cfg.quality, 1);

        let cfg = limits.resolve(Some(640), Some(360), Some(10), Some(80));
        assert_eq!(cfg, StreamConfig { width: 640, height: 360, fps: 10, quality: 80 });
    }
}
