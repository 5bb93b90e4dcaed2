//! Screen capture.
//!
//! The scrap capturer is pinned to a dedicated thread (it is !Send on X11) and
//! answers one snapshot per request. Dropping the handle ends the thread and
//! releases the display.

use async_trait::async_trait;
use scrap::{Capturer, Display};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{PixelLayout, RawFrame};
use crate::error::{Result, StreamError};

/// How long to wait for the platform to produce a frame before giving up
const GRAB_DEADLINE: Duration = Duration::from_secs(2);

/// Source of raw monitor snapshots
#[async_trait]
pub trait CaptureSource: Send {
    async fn capture(&mut self) -> Result<RawFrame>;
}

/// Opens a fresh capture source for each stream
pub trait CaptureOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureSource>>;
}

/// Display info for `screencast monitors`
#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub index: usize,
    pub width: usize,
    pub height: usize,
}

pub fn list_monitors() -> Result<Vec<MonitorInfo>> {
    let displays = Display::all().map_err(|e| StreamError::Capture(e.to_string()))?;
    Ok(displays
        .iter()
        .enumerate()
        .map(|(index, d)| MonitorInfo {
            index,
            width: d.width(),
            height: d.height(),
        })
        .collect())
}

/// Opens the monitor at `monitor` (index into the platform display list)
pub struct ScrapOpener {
    monitor: usize,
}

impl ScrapOpener {
    pub fn new(monitor: usize) -> Self {
        Self { monitor }
    }
}

impl CaptureOpener for ScrapOpener {
    fn open(&self) -> Result<Box<dyn CaptureSource>> {
        Ok(Box::new(ScreenCapture::open(self.monitor)?))
    }
}

type GrabReply = oneshot::Sender<Result<RawFrame>>;

/// Handle to a capture thread bound to one monitor
pub struct ScreenCapture {
    requests: std_mpsc::Sender<GrabReply>,
}

impl ScreenCapture {
    pub fn open(monitor: usize) -> Result<Self> {
        let (req_tx, req_rx) = std_mpsc::channel::<GrabReply>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(usize, usize)>>();

        std::thread::Builder::new()
            .name(format!("capture-{}", monitor))
            .spawn(move || {
                // Create Capturer inside the thread (scrap::Capturer is !Send on X11)
                let (capturer, w, h) = match open_capturer(monitor) {
                    Ok((capturer, w, h)) => {
                        let _ = ready_tx.send(Ok((w, h)));
                        (capturer, w, h)
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                grab_loop(capturer, w, h, req_rx);
            })
            .map_err(|e| StreamError::Capture(format!("failed to spawn capture thread: {}", e)))?;

        let (w, h) = ready_rx
            .recv()
            .map_err(|_| StreamError::Capture("capture thread exited".to_string()))??;
        debug!(monitor, width = w, height = h, "capture opened");

        Ok(Self { requests: req_tx })
    }
}

#[async_trait]
impl CaptureSource for ScreenCapture {
    async fn capture(&mut self) -> Result<RawFrame> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(reply_tx)
            .map_err(|_| StreamError::Capture("capture thread exited".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StreamError::Capture("capture thread exited".to_string()))?
    }
}

fn open_capturer(monitor: usize) -> Result<(Capturer, usize, usize)> {
    let display = Display::all()
        .map_err(|e| StreamError::Capture(format!("no display: {}", e)))?
        .into_iter()
        .nth(monitor)
        .ok_or_else(|| StreamError::Capture(format!("monitor {} not found", monitor)))?;
    let w = display.width();
    let h = display.height();
    let capturer =
        Capturer::new(display).map_err(|e| StreamError::Capture(format!("failed to start: {}", e)))?;
    Ok((capturer, w, h))
}

fn grab_loop(mut capturer: Capturer, w: usize, h: usize, requests: std_mpsc::Receiver<GrabReply>) {
    // Ends when the ScreenCapture handle is dropped
    while let Ok(reply) = requests.recv() {
        let result = grab(&mut capturer, w, h);
        if let Err(ref e) = result {
            warn!("screen grab failed: {}", e);
        }
        let _ = reply.send(result);
    }
}

fn grab(capturer: &mut Capturer, w: usize, h: usize) -> Result<RawFrame> {
    let started = Instant::now();
    loop {
        match capturer.frame() {
            Ok(frame) => {
                // scrap gives us BGRA pixels (stride may include padding)
                let stride = frame.len() / h.max(1);
                return Ok(RawFrame {
                    width: w as u32,
                    height: h as u32,
                    stride,
                    data: frame.to_vec(),
                    layout: PixelLayout::Bgra8,
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if started.elapsed() > GRAB_DEADLINE {
                    return Err(StreamError::Capture("timed out waiting for a frame".to_string()));
                }
                // Frame not ready yet
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(StreamError::Capture(e.to_string())),
        }
    }
}
