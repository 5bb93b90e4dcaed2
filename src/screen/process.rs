//! Pixel layout normalisation and resampling.

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::{PixelLayout, RawFrame};
use crate::error::{Result, StreamError};

/// Converts snapshots to packed RGB at the session's output size
#[derive(Debug, Clone, Copy)]
pub struct FrameProcessor {
    filter: FilterType,
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl FrameProcessor {
    /// Always returns a `target_w × target_h` RGB frame.
    /// When the size already matches only the layout is normalised.
    pub fn process(&self, raw: RawFrame, target_w: u32, target_h: u32) -> Result<RawFrame> {
        if target_w == 0 || target_h == 0 {
            return Err(StreamError::Encode(format!(
                "invalid target size {}x{}",
                target_w, target_h
            )));
        }

        let (w, h) = (raw.width, raw.height);
        let rgb = to_packed_rgb(raw)?;
        if w == target_w && h == target_h {
            return Ok(RawFrame::packed(w, h, rgb, PixelLayout::Rgb8));
        }

        let img: RgbImage = RgbImage::from_raw(w, h, rgb)
            .ok_or_else(|| StreamError::Capture("Invalid image dimensions".to_string()))?;
        let resized = imageops::resize(&img, target_w, target_h, self.filter);
        Ok(RawFrame::packed(
            target_w,
            target_h,
            resized.into_raw(),
            PixelLayout::Rgb8,
        ))
    }
}

/// Strip row padding and reorder BGRA → RGB
fn to_packed_rgb(raw: RawFrame) -> Result<Vec<u8>> {
    let w = raw.width as usize;
    let h = raw.height as usize;
    let bpp = raw.layout.bytes_per_pixel();
    if raw.stride < w * bpp || raw.data.len() < raw.stride * h.saturating_sub(1) + w * bpp {
        return Err(StreamError::Capture(format!(
            "short pixel buffer: {} bytes for {}x{} (stride {})",
            raw.data.len(),
            w,
            h,
            raw.stride
        )));
    }

    match raw.layout {
        PixelLayout::Rgb8 if raw.stride == w * 3 => Ok(raw.data),
        PixelLayout::Rgb8 => {
            let mut rgb = Vec::with_capacity(w * h * 3);
            for row in raw.data.chunks(raw.stride).take(h) {
                rgb.extend_from_slice(&row[..w * 3]);
            }
            Ok(rgb)
        }
        PixelLayout::Bgra8 => {
            let mut rgb = Vec::with_capacity(w * h * 3);
            for row in raw.data.chunks(raw.stride).take(h) {
                for px in row[..w * 4].chunks_exact(4) {
                    rgb.push(px[2]); // R (BGRA → R is at +2)
                    rgb.push(px[1]); // G
                    rgb.push(px[0]); // B
                }
            }
            Ok(rgb)
        }
    }
}
