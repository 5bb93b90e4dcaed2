//! Per-connection session state.
//!
//! `Unauthenticated → Authenticated ⇄ Streaming`, with `Closed` reachable from
//! anywhere. A session owns at most one [`StreamTask`]; starting a new stream
//! stops and joins the old one before the new one is spawned.

pub mod registry;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, StreamError};
use crate::protocol::{ClientCommand, ServerMessage};
use crate::screen::capture::CaptureOpener;
use crate::screen::StreamConfig;
use crate::stream::{FrameSink, LiveSettings, Pipeline, SessionEvent, StreamOutcome, StreamTask};
use registry::{SessionGuard, SessionRegistry};

/// Shared by every session of the process
pub struct SessionContext {
    pub config: ServerConfig,
    pub opener: Arc<dyn CaptureOpener>,
    pub registry: SessionRegistry,
}

impl SessionContext {
    pub fn new(config: ServerConfig, opener: Arc<dyn CaptureOpener>) -> Self {
        let registry = SessionRegistry::new(config.max_sessions);
        Self {
            config,
            opener,
            registry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Streaming,
    Closed,
}

pub struct Session {
    ctx: Arc<SessionContext>,
    guard: Option<SessionGuard>,
    id: String,
    sink: Arc<dyn FrameSink>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    settings: Arc<LiveSettings>,
    stream_config: Option<StreamConfig>,
    task: Option<StreamTask>,
    generation: u64,
}

impl Session {
    pub fn new(
        ctx: Arc<SessionContext>,
        guard: SessionGuard,
        sink: Arc<dyn FrameSink>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let limits = ctx.config.limits;
        Self {
            id: guard.id().to_string(),
            guard: Some(guard),
            sink,
            events,
            state: SessionState::Unauthenticated,
            settings: Arc::new(LiveSettings::new(limits.default_fps, limits.default_quality)),
            stream_config: None,
            task: None,
            generation: 0,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated | SessionState::Streaming)
    }

    pub fn authenticate(&mut self, password: &str) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        if !self.ctx.config.password.matches(password) {
            return false;
        }
        if self.state == SessionState::Unauthenticated {
            self.state = SessionState::Authenticated;
        }
        if let Some(guard) = &self.guard {
            guard.set_authenticated(true);
        }
        true
    }

    /// Start (or restart) the stream. The previous pipeline, if any, has fully
    /// exited before `streamStarted` is sent and the new one is spawned.
    pub async fn start_stream(
        &mut self,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<u32>,
        quality: Option<u32>,
    ) -> Result<StreamConfig> {
        if !self.is_authenticated() {
            return Err(StreamError::Auth("not authenticated".to_string()));
        }
        self.stop_stream().await;

        let config = self.ctx.config.limits.resolve(width, height, fps, quality);
        let capture = self.ctx.opener.open()?;
        self.settings.set_fps(config.fps);
        self.settings.set_quality(config.quality);

        self.sink
            .send(&ServerMessage::StreamStarted {
                width: config.width,
                height: config.height,
                fps: config.fps,
            })
            .await?;

        self.generation += 1;
        self.task = Some(StreamTask::spawn(Pipeline {
            session: self.id.clone(),
            generation: self.generation,
            width: config.width,
            height: config.height,
            settings: self.settings.clone(),
            capture,
            sink: self.sink.clone(),
            events: self.events.clone(),
        }));
        self.stream_config = Some(config);
        self.state = SessionState::Streaming;
        if let Some(guard) = &self.guard {
            guard.set_streaming(true);
        }
        Ok(config)
    }

    /// Stop and join the running pipeline. Returns false if nothing was running.
    pub async fn stop_stream(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        if let StreamOutcome::Failed(e) = task.stop().await {
            warn!(session = %self.id, "stream generation ended with error: {}", e);
        }
        self.stream_config = None;
        if self.state == SessionState::Streaming {
            self.state = SessionState::Authenticated;
        }
        if let Some(guard) = &self.guard {
            guard.set_streaming(false);
        }
        true
    }

    /// Reclaim a pipeline that ended on its own. Stale generations are ignored.
    pub async fn reap_stream(&mut self, generation: u64) {
        if self.task.as_ref().map(|t| t.generation()) == Some(generation) {
            self.stop_stream().await;
        }
    }

    /// Apply fps/quality to the live settings. A running stream picks them up
    /// on its next frame.
    pub fn update_settings(&mut self, fps: Option<u32>, quality: Option<u32>) {
        if let Some(fps) = fps {
            self.settings.set_fps(fps);
        }
        if let Some(quality) = quality {
            self.settings.set_quality(quality);
        }
        if let Some(config) = self.stream_config.as_mut() {
            config.fps = self.settings.fps();
            config.quality = self.settings.quality();
        }
    }

    /// Handle one text message from the viewer. Only transport errors escape.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        match ClientCommand::parse(text) {
            Ok(cmd) => self.dispatch(cmd).await,
            Err(e) => self.report(&e).await,
        }
    }

    pub async fn dispatch(&mut self, cmd: ClientCommand) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(StreamError::Transport("session closed".to_string()));
        }
        if cmd.is_privileged() && !self.is_authenticated() {
            return self.sink.send(&ServerMessage::AuthRequired).await;
        }

        match cmd {
            ClientCommand::Auth { password } => {
                if self.authenticate(&password) {
                    info!(session = %self.id, "✅ Screen client authenticated");
                    self.sink.send(&ServerMessage::AuthSuccess).await
                } else {
                    warn!(session = %self.id, "❌ Auth failed");
                    self.sink.send(&ServerMessage::AuthFailed).await
                }
            }
            ClientCommand::StartStream {
                width,
                height,
                fps,
                quality,
            } => match self.start_stream(width, height, fps, quality).await {
                Ok(_) => Ok(()),
                Err(e) => self.report(&e).await,
            },
            ClientCommand::StopStream => {
                self.stop_stream().await;
                self.sink.send(&ServerMessage::StreamStopped).await
            }
            ClientCommand::SetQuality { quality } => {
                self.update_settings(None, quality);
                Ok(())
            }
            ClientCommand::SetFps { fps } => {
                self.update_settings(fps, None);
                Ok(())
            }
        }
    }

    /// Tell the viewer about a non-fatal error; fatal ones are passed up
    async fn report(&mut self, err: &StreamError) -> Result<()> {
        if err.is_fatal_to_session() {
            return Err(StreamError::Transport(err.to_string()));
        }
        self.sink.send(&ServerMessage::error(err)).await
    }

    /// Tear down: stop the stream and leave the registry. Safe to call twice.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.stop_stream().await;
        self.state = SessionState::Closed;
        // Dropping the guard is the single point where the registry entry goes
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::registry::TransportKind;
    use super::*;
    use crate::stream::testing::{ChannelSink, FakeOpener};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        ctx: Arc<SessionContext>,
        opener: Arc<FakeOpener>,
        session: Session,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness_with(opener: FakeOpener) -> Harness {
        let opener = Arc::new(opener);
        let ctx = Arc::new(SessionContext::new(
            ServerConfig::with_password("secret"),
            opener.clone(),
        ));
        let guard = ctx
            .registry
            .register("127.0.0.1:9".into(), TransportKind::Messages)
            .unwrap();
        let (sink, rx) = ChannelSink::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = Session::new(ctx.clone(), guard, sink, events_tx);
        Harness {
            ctx,
            opener,
            session,
            rx,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeOpener::default())
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn test_unauthenticated_start_gets_auth_required() {
        let mut h = harness();
        h.session
            .handle_text(r#"{"command":"startStream","fps":10}"#)
            .await
            .unwrap();
        assert_eq!(next(&mut h.rx).await, ServerMessage::AuthRequired);
        assert_eq!(h.opener.opened.load(Ordering::SeqCst), 0);
        assert_eq!(h.ctx.registry.counts().streams, 0);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_wrong_password_keeps_connection_for_retry() {
        let mut h = harness();
        h.session.handle_text(r#"{"command":"auth","password":"nope"}"#).await.unwrap();
        assert_eq!(next(&mut h.rx).await, ServerMessage::AuthFailed);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);

        h.session.handle_text(r#"{"command":"auth","password":"secret"}"#).await.unwrap();
        assert_eq!(next(&mut h.rx).await, ServerMessage::AuthSuccess);
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert_eq!(h.ctx.registry.counts().authenticated, 1);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_reported_not_fatal() {
        let mut h = harness();
        h.session.handle_text("not json").await.unwrap();
        assert_eq!(
            next(&mut h.rx).await,
            ServerMessage::Error { message: "Invalid JSON".into() }
        );
        h.session.handle_text(r#"{"command":"selfDestruct"}"#).await.unwrap();
        assert!(matches!(next(&mut h.rx).await, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_stream_scenario() {
        // Native-size frames: only layout conversion and JPEG run per frame
        let mut h = harness_with(FakeOpener {
            frame_size: Some((640, 360)),
            ..Default::default()
        });
        h.session.handle_text(r#"{"command":"auth","password":"secret"}"#).await.unwrap();
        assert_eq!(next(&mut h.rx).await, ServerMessage::AuthSuccess);

        h.session
            .handle_text(r#"{"command":"startStream","width":640,"height":360,"fps":10}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut h.rx).await,
            ServerMessage::StreamStarted { width: 640, height: 360, fps: 10 }
        );
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert_eq!(h.ctx.registry.counts().streams, 1);

        let mut stamps = Vec::new();
        for expected in 0..5u64 {
            match next(&mut h.rx).await {
                ServerMessage::Frame { frame, timestamp, .. } => {
                    assert_eq!(frame, expected);
                    stamps.push(timestamp);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // Four 100ms intervals at 10 fps
        let span = stamps[4] - stamps[0];
        assert!(span > 0.35 && span < 0.6, "4 intervals took {}s", span);

        h.session.handle_text(r#"{"command":"stopStream"}"#).await.unwrap();
        loop {
            match next(&mut h.rx).await {
                ServerMessage::Frame { .. } => continue,
                ServerMessage::StreamStopped => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert_eq!(h.ctx.registry.counts().streams, 0);
    }

    #[tokio::test]
    async fn test_restart_never_interleaves_generations() {
        let mut h = harness();
        assert!(h.session.authenticate("secret"));
        h.session.start_stream(Some(64), Some(48), Some(60), None).await.unwrap();
        assert!(matches!(next(&mut h.rx).await, ServerMessage::StreamStarted { .. }));
        // Let the first generation get a few frames out
        for _ in 0..3 {
            assert!(matches!(next(&mut h.rx).await, ServerMessage::Frame { .. }));
        }

        h.session.start_stream(Some(32), Some(24), Some(60), None).await.unwrap();
        // Everything queued before the second streamStarted is from generation 1,
        // everything after is from generation 2 and starts at sequence 0
        loop {
            match next(&mut h.rx).await {
                ServerMessage::Frame { .. } => continue,
                ServerMessage::StreamStarted { width, height, .. } => {
                    assert_eq!((width, height), (32, 24));
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        for expected in 0..3u64 {
            match next(&mut h.rx).await {
                ServerMessage::Frame { frame, .. } => assert_eq!(frame, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(h.opener.opened.load(Ordering::SeqCst), 2);
        assert_eq!(h.ctx.registry.counts().streams, 1);
        h.session.close().await;
    }

    #[tokio::test]
    async fn test_fps_and_quality_are_clamped() {
        let mut h = harness();
        assert!(h.session.authenticate("secret"));
        let cfg = h
            .session
            .start_stream(Some(5000), Some(5000), Some(240), Some(0))
            .await
            .unwrap();
        assert_eq!(cfg, StreamConfig { width: 1280, height: 720, fps: 60, quality: 1 });

        h.session.handle_text(r#"{"command":"setFps","fps":0}"#).await.unwrap();
        assert_eq!(h.session.settings.fps(), 1);
        h.session.handle_text(r#"{"command":"setQuality","quality":85}"#).await.unwrap();
        assert_eq!(h.session.settings.quality(), 85);
        assert_eq!(h.session.stream_config.unwrap().quality, 85);
        h.session.close().await;
    }

    #[tokio::test]
    async fn test_out_of_range_numbers_start_a_clamped_stream() {
        let mut h = harness();
        assert!(h.session.authenticate("secret"));
        h.session
            .handle_text(r#"{"command":"startStream","width":64,"height":48,"fps":-5,"quality":-20}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut h.rx).await,
            ServerMessage::StreamStarted { width: 64, height: 48, fps: 1 }
        );
        assert_eq!(h.session.settings.quality(), 1);

        h.session.handle_text(r#"{"command":"setFps","fps":29.97}"#).await.unwrap();
        assert_eq!(h.session.settings.fps(), 30);
        h.session.close().await;
    }

    #[tokio::test]
    async fn test_capture_unavailable_keeps_session_open() {
        let mut h = harness_with(FakeOpener {
            unavailable: true,
            ..Default::default()
        });
        assert!(h.session.authenticate("secret"));
        h.session.handle_text(r#"{"command":"startStream"}"#).await.unwrap();
        assert!(matches!(next(&mut h.rx).await, ServerMessage::Error { .. }));
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert_eq!(h.ctx.registry.counts().streams, 0);
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_reaped() {
        let mut h = harness_with(FakeOpener {
            fail_after: Some(1),
            ..Default::default()
        });
        assert!(h.session.authenticate("secret"));
        h.session.start_stream(Some(32), Some(24), Some(60), None).await.unwrap();

        match h.events.recv().await.unwrap() {
            SessionEvent::StreamEnded { generation } => h.session.reap_stream(generation).await,
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert_eq!(h.ctx.registry.counts().streams, 0);

        // Client may start again
        h.session.start_stream(Some(32), Some(24), Some(60), None).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        h.session.close().await;
    }

    #[tokio::test]
    async fn test_close_mid_stream_clears_registry_once() {
        let mut h = harness();
        assert!(h.session.authenticate("secret"));
        h.session.start_stream(None, None, Some(30), None).await.unwrap();
        assert_eq!(h.ctx.registry.counts().streams, 1);

        h.session.close().await;
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.ctx.registry.counts().sessions, 0);
        assert_eq!(h.ctx.registry.counts().streams, 0);

        // Second teardown is a no-op, and a closed session accepts nothing
        h.session.close().await;
        assert!(h.session.dispatch(ClientCommand::StopStream).await.is_err());
        assert!(!h.session.authenticate("secret"));
    }

    #[tokio::test]
    async fn test_stop_without_stream_still_acknowledges() {
        let mut h = harness();
        assert!(h.session.authenticate("secret"));
        h.session.handle_text(r#"{"command":"stopStream"}"#).await.unwrap();
        assert_eq!(next(&mut h.rx).await, ServerMessage::StreamStopped);
        assert!(!h.session.stop_stream().await);
    }
}
