//! Negotiated-track transport.
//!
//! A [`TrackSource`] is pulled for samples: each `next_sample` call waits for
//! the sample's slot (same [`Pacer`] as the message loop), grabs, resizes and
//! H.264-encodes. [`pump`] feeds those samples into the WebRTC track until the
//! peer connection goes away.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Result, StreamError};
use crate::screen::capture::CaptureSource;
use crate::screen::encode::{EncodedSample, SampleEncoder};
use crate::screen::pacer::Pacer;
use crate::screen::process::FrameProcessor;
use crate::screen::StreamConfig;

/// H.264 wants even dimensions. Rounds down so the result never exceeds the
/// resolved limit; a 1-pixel side has no even size left and is refused.
pub fn even_dimensions(config: StreamConfig) -> Result<StreamConfig> {
    let (width, height) = (config.width & !1, config.height & !1);
    if width == 0 || height == 0 {
        return Err(StreamError::Encode(format!(
            "{}x{} has no even size for H.264",
            config.width, config.height
        )));
    }
    Ok(StreamConfig { width, height, ..config })
}

pub struct TrackSource {
    capture: Box<dyn CaptureSource>,
    processor: FrameProcessor,
    encoder: SampleEncoder,
    pacer: Pacer,
    next_index: u64,
}

impl TrackSource {
    pub fn new(capture: Box<dyn CaptureSource>, config: StreamConfig) -> Result<Self> {
        let config = even_dimensions(config)?;
        let encoder = SampleEncoder::new(config.width, config.height, config.fps, config.quality)?;
        Ok(Self {
            capture,
            processor: FrameProcessor::default(),
            encoder,
            pacer: Pacer::new(config.fps),
            next_index: 0,
        })
    }

    pub fn fps(&self) -> u32 {
        self.pacer.fps()
    }

    /// Produce the next sample once it is due
    pub async fn next_sample(&mut self) -> Result<EncodedSample> {
        self.pacer.wait().await;

        let raw = self.capture.capture().await?;
        let (w, h) = self.encoder.dimensions();
        let frame = self.processor.process(raw, w, h)?;
        let sample = self.encoder.encode(&frame, self.next_index, self.pacer.fps())?;

        self.next_index += 1;
        if let Some(actual) = self.pacer.frame_done() {
            debug!("📊 Track: {:.1} FPS", actual);
        }
        Ok(sample)
    }
}

/// Write samples into `track` until `stop` flips or a stage fails
pub async fn pump(
    session: &str,
    mut source: TrackSource,
    track: Arc<TrackLocalStaticSample>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    info!(session, fps = source.fps(), "📺 Track stream started");
    let mut written: u64 = 0;

    let result = loop {
        let sample = tokio::select! {
            biased;
            _ = super::stop_requested(&mut stop) => break Ok(()),
            sample = source.next_sample() => sample,
        };

        let sample = match sample {
            Ok(sample) => sample,
            Err(e) => break Err(e),
        };

        let duration = sample.duration();
        trace!(session, index = sample.index, pts = sample.pts_ticks(), "writing sample");
        if let Err(e) = track
            .write_sample(&Sample {
                data: sample.data.into(),
                duration,
                ..Default::default()
            })
            .await
        {
            break Err(StreamError::Transport(format!("Failed to write RTP sample: {}", e)));
        }
        written += 1;
    };

    match &result {
        Ok(()) => info!(session, "📺 Track stream ended after {} samples", written),
        Err(e) => warn!(session, "❌ Track stream error after {} samples: {}", written, e),
    }
    result
}
