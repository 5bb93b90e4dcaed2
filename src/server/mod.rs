pub mod http;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::protocol::ServerMessage;
use crate::session::registry::TransportKind;
use crate::session::{Session, SessionContext, SessionState};
use crate::stream::{FrameSink, SessionEvent, WsSink};

/// WebSocket endpoint for the framed-message transport
pub struct ScreenServer {
    ctx: Arc<SessionContext>,
}

impl ScreenServer {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = &self.ctx.config.ws_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {}", addr))?;
        info!("🔌 WebSocket: ws://{}", addr);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, ctx).await {
                    let err_str = e.to_string();
                    // Silently ignore non-WebSocket connections (bots/scanners)
                    if !err_str.contains("Connection: upgrade") && !err_str.contains("protocol error") {
                        error!(%peer, "❌ Connection error: {:#}", e);
                    }
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let sink: Arc<dyn FrameSink> = Arc::new(WsSink::new(ws_sender));

    let guard = match ctx.registry.register(peer.to_string(), TransportKind::Messages) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(%peer, "refusing screen client: {}", e);
            let _ = sink.send(&ServerMessage::Error { message: e.to_string() }).await;
            sink.close().await;
            return Ok(());
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(ctx.clone(), guard, sink.clone(), events_tx);
    info!(session = %session.id(), %peer, "🔌 New screen client");

    let result = match sink.send(&ServerMessage::AuthRequired).await {
        Ok(()) => {
            drive(
                &mut session,
                &mut ws_receiver,
                &mut events_rx,
                ctx.config.auth_timeout,
                sink.as_ref(),
            )
            .await
        }
        Err(e) => Err(e),
    };

    // Single exit path: every way out of drive() lands here
    session.close().await;
    sink.close().await;

    match result {
        Ok(()) => info!(session = %session.id(), %peer, "❌ Screen client disconnected"),
        Err(e) => warn!(session = %session.id(), %peer, "❌ Screen client dropped: {}", e),
    }
    Ok(())
}

/// Read commands and pipeline events until the peer leaves or the transport fails
async fn drive<R, E>(
    session: &mut Session,
    ws_receiver: &mut R,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    auth_timeout: Option<Duration>,
    sink: &dyn FrameSink,
) -> Result<(), StreamError>
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let auth_deadline = tokio::time::sleep(auth_timeout.unwrap_or(Duration::MAX / 4));
    tokio::pin!(auth_deadline);

    loop {
        let waiting_for_auth =
            auth_timeout.is_some() && session.state() == SessionState::Unauthenticated;

        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(&text).await?,
                Some(Ok(WsMessage::Binary(_))) => {
                    let err = StreamError::Protocol("binary messages are not supported".to_string());
                    sink.send(&ServerMessage::error(&err)).await?;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(session = %session.id(), "❌ WebSocket error: {}", e);
                    return Ok(());
                }
            },
            Some(event) = events.recv() => match event {
                SessionEvent::StreamEnded { generation } => {
                    debug!(session = %session.id(), generation, "reaping failed stream");
                    session.reap_stream(generation).await;
                }
                SessionEvent::TransportLost => {
                    return Err(StreamError::Transport("peer stopped receiving frames".to_string()));
                }
            },
            _ = &mut auth_deadline, if waiting_for_auth => {
                let err = StreamError::Auth("authentication timeout".to_string());
                let _ = sink.send(&ServerMessage::error(&err)).await;
                return Err(err);
            }
        }
    }
}

pub async fn start_server(ctx: Arc<SessionContext>) -> Result<()> {
    let ws = ScreenServer::new(ctx.clone());
    let http = http::HttpServer::new(ctx.clone());

    tokio::select! {
        r = ws.run() => r,
        r = http.run() => r,
        _ = tokio::signal::ctrl_c() => {
            for (peer, transport) in ctx.registry.peers() {
                debug!(%peer, ?transport, "dropping session on shutdown");
            }
            let counts = ctx.registry.counts();
            info!(streams = counts.streams, sessions = counts.sessions, "✋ Screen server stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::stream::testing::FakeOpener;
    use futures_util::SinkExt;
    use tokio_tungstenite::connect_async;

    async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<SessionContext>) {
        let ctx = Arc::new(SessionContext::new(config, Arc::new(FakeOpener::default())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ScreenServer::new(ctx.clone());
        tokio::spawn(async move { server.serve(listener).await });
        (addr, ctx)
    }

    async fn recv_json<S>(ws: &mut S) -> ServerMessage
    where
        S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for_sessions(ctx: &SessionContext, expected: usize) {
        for _ in 0..100 {
            if ctx.registry.counts().sessions == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("registry never reached {} sessions", expected);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_clears_health_counts() {
        let (addr, ctx) = spawn_server(ServerConfig::with_password("pw")).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        assert_eq!(recv_json(&mut ws).await, ServerMessage::AuthRequired);
        ws.send(WsMessage::Text(r#"{"command":"auth","password":"pw"}"#.into()))
            .await
            .unwrap();
        assert_eq!(recv_json(&mut ws).await, ServerMessage::AuthSuccess);
        ws.send(WsMessage::Text(
            r#"{"command":"startStream","width":32,"height":24,"fps":30}"#.into(),
        ))
        .await
        .unwrap();
        assert!(matches!(recv_json(&mut ws).await, ServerMessage::StreamStarted { .. }));
        assert!(matches!(recv_json(&mut ws).await, ServerMessage::Frame { frame: 0, .. }));
        assert_eq!(ctx.registry.counts().streams, 1);

        drop(ws);
        wait_for_sessions(&ctx, 0).await;
        assert_eq!(ctx.registry.counts().streams, 0);
    }

    #[tokio::test]
    async fn test_session_cap_refuses_extra_clients() {
        let mut config = ServerConfig::with_password("pw");
        config.max_sessions = 1;
        let (addr, ctx) = spawn_server(config).await;

        let (mut first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert_eq!(recv_json(&mut first).await, ServerMessage::AuthRequired);

        let (mut second, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(matches!(recv_json(&mut second).await, ServerMessage::Error { .. }));
        assert_eq!(ctx.registry.counts().sessions, 1);
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_idle_connection() {
        let mut config = ServerConfig::with_password("pw");
        config.auth_timeout = Some(Duration::from_millis(100));
        let (addr, ctx) = spawn_server(config).await;

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert_eq!(recv_json(&mut ws).await, ServerMessage::AuthRequired);
        assert!(matches!(recv_json(&mut ws).await, ServerMessage::Error { .. }));
        wait_for_sessions(&ctx, 0).await;
    }
}
