//! Frame encoders.
//!
//! `ImageEncoder` produces standalone JPEGs for the message transport.
//! `SampleEncoder` produces H.264 access units for the WebRTC track, stamped
//! with a rational presentation time (`index / fps`) rather than wall clock.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;
use std::io::Cursor;
use std::time::Duration;

use super::{PixelLayout, RawFrame};
use crate::error::{Result, StreamError};

/// RTP clock rate for video
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

fn check_frame(frame: &RawFrame) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(StreamError::Encode(format!(
            "invalid dimensions {}x{}",
            frame.width, frame.height
        )));
    }
    if frame.layout != PixelLayout::Rgb8
        || frame.data.len() != (frame.width * frame.height * 3) as usize
    {
        return Err(StreamError::Encode("expected packed RGB input".to_string()));
    }
    Ok(())
}

/// JPEG encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageEncoder;

impl ImageEncoder {
    pub fn encode(&self, frame: &RawFrame, quality: u32) -> Result<Vec<u8>> {
        if !(1..=100).contains(&quality) {
            return Err(StreamError::Encode(format!("quality {} out of range 1-100", quality)));
        }
        check_frame(frame)?;

        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality as u8);

        let img: RgbImage = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| StreamError::Encode("Invalid image dimensions".to_string()))?;

        img.write_with_encoder(encoder)
            .map_err(|e| StreamError::Encode(format!("JPEG encode failed: {}", e)))?;

        Ok(buf.into_inner())
    }
}

/// Presentation time of sample `index` in 90 kHz ticks (time base 1/fps)
pub fn sample_ticks(index: u64, fps: u32) -> u64 {
    index * VIDEO_CLOCK_RATE / fps.max(1) as u64
}

/// Duration of sample `index` such that a consumer converting it back to
/// 90 kHz ticks (truncating) lands exactly on the next rational timestamp.
pub fn sample_duration(index: u64, fps: u32) -> Duration {
    let delta = sample_ticks(index + 1, fps) - sample_ticks(index, fps);
    // Half a tick of headroom survives the float truncation on the other side
    let nanos = (2 * delta + 1) * 1_000_000_000 / (2 * VIDEO_CLOCK_RATE);
    Duration::from_nanos(nanos)
}

/// One encoded media sample
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub index: u64,
    pub fps: u32,
}

impl EncodedSample {
    pub fn pts_ticks(&self) -> u64 {
        sample_ticks(self.index, self.fps)
    }

    pub fn duration(&self) -> Duration {
        sample_duration(self.index, self.fps)
    }
}

/// H.264 encoder (OpenH264, software)
pub struct SampleEncoder {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl SampleEncoder {
    pub fn new(width: u32, height: u32, fps: u32, quality: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(StreamError::Encode(format!(
                "H.264 needs non-zero even dimensions, got {}x{}",
                width, height
            )));
        }
        if !(1..=100).contains(&quality) {
            return Err(StreamError::Encode(format!("quality {} out of range 1-100", quality)));
        }

        let config = EncoderConfig::new()
            .set_bitrate_bps(target_bitrate(width, height, fps, quality))
            .max_frame_rate(fps as f32)
            .enable_skip_frame(false);

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| StreamError::Encode(format!("Failed to create OpenH264 encoder: {}", e)))?;

        Ok(Self {
            encoder,
            width,
            height,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn encode(&mut self, frame: &RawFrame, index: u64, fps: u32) -> Result<EncodedSample> {
        check_frame(frame)?;
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(StreamError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let yuv = YUVBuffer::from_vec(
            rgb_to_yuv420(&frame.data, self.width, self.height),
            self.width as usize,
            self.height as usize,
        );
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| StreamError::Encode(format!("Encode failed: {}", e)))?;

        Ok(EncodedSample {
            data: bitstream.to_vec(),
            index,
            fps,
        })
    }
}

/// Rough bitrate for a given quality: ~0.05 bpp at q=1 up to ~0.2 bpp at q=100
fn target_bitrate(width: u32, height: u32, fps: u32, quality: u32) -> u32 {
    let pixels_per_sec = width as u64 * height as u64 * fps as u64;
    let millibits_per_pixel = 50 + 150 * quality as u64 / 100;
    (pixels_per_sec * millibits_per_pixel / 1000).min(u32::MAX as u64) as u32
}

/// Packed RGB → I420. Chroma taken from the top-left pixel of each 2x2 block.
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_w = w / 2;
    let uv_h = h / 2;
    let uv_size = uv_w * uv_h;
    let mut yuv = vec![0u8; y_size + 2 * uv_size];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let si = (y * w + x) * 3;
            let r = rgb[si] as i32;
            let g = rgb[si + 1] as i32;
            let b = rgb[si + 2] as i32;
            y_plane[y * w + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }

    for by in 0..uv_h {
        for bx in 0..uv_w {
            let si = ((by * 2) * w + bx * 2) * 3;
            let r = rgb[si] as i32;
            let g = rgb[si + 1] as i32;
            let b = rgb[si + 2] as i32;
            let ui = by * uv_w + bx;
            u_plane[ui] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_plane[ui] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(w: u32, h: u32) -> RawFrame {
        RawFrame::packed(w, h, vec![128u8; (w * h * 3) as usize], PixelLayout::Rgb8)
    }

    #[test]
    fn test_jpeg_has_soi_marker() {
        let jpeg = ImageEncoder.encode(&rgb_frame(16, 8), 60).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_higher_quality_is_not_smaller() {
        let mut frame = rgb_frame(64, 64);
        for (i, b) in frame.data.iter_mut().enumerate() {
            *b = (i * 7 % 251) as u8;
        }
        let low = ImageEncoder.encode(&frame, 10).unwrap();
        let high = ImageEncoder.encode(&frame, 95).unwrap();
        assert!(high.len() >= low.len());
    }

    #[test]
    fn test_jpeg_rejects_bad_quality_and_dims() {
        assert!(matches!(
            ImageEncoder.encode(&rgb_frame(4, 4), 0),
            Err(StreamError::Encode(_))
        ));
        assert!(matches!(
            ImageEncoder.encode(&rgb_frame(4, 4), 101),
            Err(StreamError::Encode(_))
        ));
        let mut bad = rgb_frame(4, 4);
        bad.width = 0;
        assert!(matches!(ImageEncoder.encode(&bad, 50), Err(StreamError::Encode(_))));
    }

    #[test]
    fn test_sample_timestamps_are_rational() {
        // One second worth of samples adds up to exactly one second of ticks
        for fps in [1u32, 7, 24, 30, 60] {
            let total: u64 = (0..fps as u64)
                .map(|i| (sample_duration(i, fps).as_secs_f64() * VIDEO_CLOCK_RATE as f64) as u64)
                .sum();
            assert_eq!(total, VIDEO_CLOCK_RATE, "fps {}", fps);
            assert_eq!(sample_ticks(fps as u64, fps), VIDEO_CLOCK_RATE);
        }
    }

    #[test]
    fn test_sample_ticks_strictly_increase() {
        let mut last = None;
        for i in 0..500 {
            let t = sample_ticks(i, 60);
            if let Some(prev) = last {
                assert!(t > prev);
            }
            last = Some(t);
        }
    }

    #[test]
    fn test_h264_rejects_odd_dimensions() {
        assert!(matches!(
            SampleEncoder::new(641, 360, 30, 60),
            Err(StreamError::Encode(_))
        ));
    }

    #[test]
    fn test_yuv_plane_sizes() {
        let yuv = rgb_to_yuv420(&vec![0u8; 8 * 4 * 3], 8, 4);
        assert_eq!(yuv.len(), 8 * 4 + 2 * (4 * 2));
        // Black maps to studio-range Y=16
        assert_eq!(yuv[0], 16);
    }
}
