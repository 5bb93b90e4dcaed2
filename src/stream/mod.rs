//! The capture → process → encode → send loop.
//!
//! One pipeline task runs per streaming session. It reads fps/quality from
//! [`LiveSettings`] at the top of every iteration, so setting changes apply on
//! the next frame without restarting. The stop signal is observed while pacing,
//! capturing, encoding and sending. A WebSocket write that makes no progress
//! for [`SEND_TIMEOUT`] fails as a transport error.

pub mod track;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{Sink, SinkExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::protocol::ServerMessage;
use crate::screen::capture::CaptureSource;
use crate::screen::encode::ImageEncoder;
use crate::screen::pacer::Pacer;
use crate::screen::process::FrameProcessor;
use crate::screen::{clamp_fps, clamp_quality};

/// A peer that accepts nothing for this long is treated as gone
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound half of a message transport
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Resolves once the message has been handed to the socket
    async fn send(&self, msg: &ServerMessage) -> Result<()>;

    async fn close(&self) {}
}

/// WebSocket text-frame sink
pub struct WsSink<S> {
    inner: Mutex<S>,
}

impl<S> WsSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: std::fmt::Display,
{
    async fn send(&self, msg: &ServerMessage) -> Result<()> {
        let text = msg
            .to_json()
            .map_err(|e| StreamError::Protocol(format!("failed to serialize message: {}", e)))?;
        let mut inner = self.inner.lock().await;
        match tokio::time::timeout(SEND_TIMEOUT, inner.send(WsMessage::Text(text))).await {
            Ok(sent) => sent.map_err(|e| StreamError::Transport(e.to_string())),
            Err(_) => Err(StreamError::Transport("peer stopped reading".to_string())),
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let _ = tokio::time::timeout(SEND_TIMEOUT, inner.close()).await;
    }
}

/// Settings a running stream re-reads every frame
#[derive(Debug)]
pub struct LiveSettings {
    fps: AtomicU32,
    quality: AtomicU32,
}

impl LiveSettings {
    pub fn new(fps: u32, quality: u32) -> Self {
        Self {
            fps: AtomicU32::new(clamp_fps(fps)),
            quality: AtomicU32::new(clamp_quality(quality)),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    pub fn quality(&self) -> u32 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn set_fps(&self, fps: u32) {
        self.fps.store(clamp_fps(fps), Ordering::Relaxed);
    }

    pub fn set_quality(&self, quality: u32) {
        self.quality.store(clamp_quality(quality), Ordering::Relaxed);
    }
}

/// Notifications from a pipeline task back to its connection
#[derive(Debug)]
pub enum SessionEvent {
    /// Stream `generation` ended on its own (capture/encode failure)
    StreamEnded { generation: u64 },
    /// The peer can no longer be reached; the session must close
    TransportLost,
}

/// How a pipeline task finished
#[derive(Debug)]
pub enum StreamOutcome {
    Stopped,
    Failed(StreamError),
}

/// Everything one pipeline task owns
pub struct Pipeline {
    pub session: String,
    pub generation: u64,
    pub width: u32,
    pub height: u32,
    pub settings: Arc<LiveSettings>,
    pub capture: Box<dyn CaptureSource>,
    pub sink: Arc<dyn FrameSink>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to a running pipeline task
pub struct StreamTask {
    generation: u64,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<StreamOutcome>>,
}

impl StreamTask {
    pub fn spawn(pipeline: Pipeline) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let generation = pipeline.generation;
        let handle = tokio::spawn(run_pipeline(pipeline, stop_rx));
        Self {
            generation,
            stop,
            handle: Some(handle),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal the task and wait until it has fully exited
    pub async fn stop(mut self) -> StreamOutcome {
        let _ = self.stop.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                StreamOutcome::Failed(StreamError::Capture(format!("pipeline task panicked: {}", e)))
            }),
            None => StreamOutcome::Stopped,
        }
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        // Dropped without stop(): still make the loop exit
        let _ = self.stop.send(true);
    }
}

/// Resolves once a stop has been requested (or the handle is gone)
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

pub async fn run_pipeline(mut p: Pipeline, mut stop: watch::Receiver<bool>) -> StreamOutcome {
    let processor = FrameProcessor::default();
    let encoder = ImageEncoder;
    let mut pacer = Pacer::new(p.settings.fps());
    let mut seq: u64 = 0;

    info!(
        session = %p.session,
        generation = p.generation,
        "📺 Starting stream: {}x{} @ {}fps",
        p.width,
        p.height,
        pacer.fps()
    );

    let outcome = loop {
        pacer.set_fps(p.settings.fps());

        let frame = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break StreamOutcome::Stopped,
            frame = produce_frame(
                &mut pacer,
                p.capture.as_mut(),
                processor,
                encoder,
                (p.width, p.height),
                &p.settings,
            ) => frame,
        };

        let msg = match frame {
            Ok((jpeg, timestamp)) => ServerMessage::Frame {
                data: base64::engine::general_purpose::STANDARD.encode(jpeg),
                timestamp,
                frame: seq,
            },
            Err(e) => {
                warn!(session = %p.session, "❌ Stream error: {}", e);
                if p.sink.send(&ServerMessage::error(&e)).await.is_err() {
                    let _ = p.events.send(SessionEvent::TransportLost);
                } else {
                    let _ = p.events.send(SessionEvent::StreamEnded {
                        generation: p.generation,
                    });
                }
                break StreamOutcome::Failed(e);
            }
        };

        let sent = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break StreamOutcome::Stopped,
            sent = p.sink.send(&msg) => sent,
        };
        if let Err(e) = sent {
            warn!(session = %p.session, "Failed to send frame: {}", e);
            let _ = p.events.send(SessionEvent::TransportLost);
            break StreamOutcome::Failed(e);
        }
        seq += 1;

        if let Some(actual) = pacer.frame_done() {
            debug!(session = %p.session, "📊 Streaming: {:.1} FPS", actual);
        }
    };

    info!(session = %p.session, generation = p.generation, "📺 Stream ended after {} frames", seq);
    outcome
}

/// Wait for the frame slot, grab, resize and JPEG-encode
async fn produce_frame(
    pacer: &mut Pacer,
    capture: &mut dyn CaptureSource,
    processor: FrameProcessor,
    encoder: ImageEncoder,
    (width, height): (u32, u32),
    settings: &LiveSettings,
) -> Result<(Vec<u8>, f64)> {
    pacer.wait().await;

    let raw = capture.capture().await?;
    let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;

    let quality = settings.quality();
    let jpeg = tokio::task::spawn_blocking(move || {
        let frame = processor.process(raw, width, height)?;
        encoder.encode(&frame, quality)
    })
    .await
    .map_err(|e| StreamError::Encode(format!("encode task failed: {}", e)))??;

    Ok((jpeg, timestamp))
}
