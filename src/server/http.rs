//! HTTP endpoints: `GET /health` and the WebRTC `POST /offer` handshake.

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::StreamError;
use crate::protocol::{OfferAnswer, OfferRequest};
use crate::screen::encode::VIDEO_CLOCK_RATE;
use crate::session::registry::{SessionGuard, TransportKind};
use crate::session::SessionContext;
use crate::stream::track::{even_dimensions, pump, TrackSource};

type AppState = Arc<SessionContext>;
type ApiError = (StatusCode, Json<Value>);

pub struct HttpServer {
    ctx: AppState,
}

impl HttpServer {
    pub fn new(ctx: AppState) -> Self {
        Self { ctx }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/offer", post(offer))
            .with_state(self.ctx.clone())
            .layer(CorsLayer::permissive())
    }

    pub async fn run(&self) -> Result<()> {
        let addr = &self.ctx.config.http_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", addr))?;
        info!("🌐 HTTP: http://{} (/health, /offer)", addr);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")
    }
}

async fn health(State(ctx): State<AppState>) -> Json<Value> {
    let counts = ctx.registry.counts();
    Json(json!({
        "status": "ok",
        "clients": counts.authenticated,
        "streams": counts.streams,
        "target_fps": ctx.config.limits.default_fps,
    }))
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

async fn offer(
    State(ctx): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<OfferAnswer>, ApiError> {
    if !ctx.config.password.matches(&req.password) {
        warn!(%peer, "❌ Offer rejected: bad password");
        return Err(api_error(StatusCode::UNAUTHORIZED, "Authentication failed"));
    }

    let guard = ctx
        .registry
        .register(peer.to_string(), TransportKind::Track)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    guard.set_authenticated(true);

    let config = even_dimensions(ctx.config.limits.resolve(req.width, req.height, req.fps, None))
        .map_err(|e| {
            warn!(%peer, "❌ Offer rejected: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    let source = ctx
        .opener
        .open()
        .and_then(|capture| TrackSource::new(capture, config))
        .map_err(|e| {
            error!(%peer, "❌ Track source unavailable: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let answer = negotiate(guard, source, req.sdp).await.map_err(|e| {
        error!(%peer, "❌ Offer error: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    info!(%peer, width = config.width, height = config.height, fps = config.fps, "📺 Track peer negotiated");
    Ok(Json(OfferAnswer {
        sdp: answer.sdp,
        kind: "answer".to_string(),
    }))
}

fn webrtc_err(context: &str) -> impl Fn(webrtc::Error) -> StreamError + '_ {
    move |e| StreamError::Transport(format!("{}: {}", context, e))
}

/// Build a peer connection carrying one H.264 track, answer the offer, and
/// hand the guard to the task that pumps samples until the peer goes away.
async fn negotiate(
    guard: SessionGuard,
    source: TrackSource,
    offer_sdp: String,
) -> Result<RTCSessionDescription, StreamError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(webrtc_err("Failed to register codecs"))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(webrtc_err("Failed to register interceptors"))?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(webrtc_err("Failed to create peer connection"))?,
    );

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE as u32,
            ..Default::default()
        },
        "video".to_owned(),
        "screencast".to_owned(),
    ));

    let result = answer_offer(&pc, &track, offer_sdp).await;
    let answer = match result {
        Ok(answer) => answer,
        Err(e) => {
            let _ = pc.close().await;
            return Err(e);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let session = guard.id().to_string();
    {
        let stop_tx = stop_tx.clone();
        let session = session.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(%session, "peer connection state: {}", state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected
            ) {
                let _ = stop_tx.send(true);
            }
            Box::pin(async {})
        }));
    }

    tokio::spawn(async move {
        guard.set_streaming(true);
        let _ = pump(&session, source, track, stop_rx).await;
        let _ = pc.close().await;
        drop(stop_tx);
        // Leaving the registry happens here, once, whatever ended the pump
        drop(guard);
    });

    Ok(answer)
}

async fn answer_offer(
    pc: &Arc<RTCPeerConnection>,
    track: &Arc<TrackLocalStaticSample>,
    offer_sdp: String,
) -> Result<RTCSessionDescription, StreamError> {
    let rtp_sender = pc
        .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(webrtc_err("Failed to add track"))?;

    // Drain RTCP so the interceptors keep running
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
    });

    let offer = RTCSessionDescription::offer(offer_sdp).map_err(webrtc_err("Invalid offer"))?;
    pc.set_remote_description(offer)
        .await
        .map_err(webrtc_err("Failed to set remote description"))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(webrtc_err("Failed to create answer"))?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(webrtc_err("Failed to set local description"))?;
    let _ = gather_complete.recv().await;

    pc.local_description()
        .await
        .ok_or_else(|| StreamError::Transport("No local description".to_string()))
}
