use std::time::Duration;
use zeroize::Zeroize;

use crate::screen::{clamp_fps, clamp_quality, StreamLimits};

/// Placeholder password shipped as the default. Anyone can guess it.
pub const INSECURE_DEFAULT_PASSWORD: &str = "changeme";

/// The viewer password. Wiped from memory on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    value: String,
}

impl SharedSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    /// Constant-time comparison (blake3::Hash equality is constant time)
    pub fn matches(&self, candidate: &str) -> bool {
        blake3::hash(self.value.as_bytes()) == blake3::hash(candidate.as_bytes())
    }

    pub fn is_insecure_default(&self) -> bool {
        self.matches(INSECURE_DEFAULT_PASSWORD) || self.value.is_empty()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}

/// Resolved server settings, shared read-only by every session
#[derive(Debug)]
pub struct ServerConfig {
    pub ws_addr: String,
    pub http_addr: String,
    pub password: SharedSecret,
    pub limits: StreamLimits,
    pub monitor: usize,
    pub max_sessions: usize,
    /// Unauthenticated connections are closed after this long. None disables.
    pub auth_timeout: Option<Duration>,
}

impl ServerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws_addr: String,
        http_addr: String,
        password: String,
        fps: u32,
        max_width: u32,
        max_height: u32,
        quality: u32,
        monitor: usize,
        max_sessions: usize,
        auth_timeout_secs: u64,
    ) -> Self {
        Self {
            ws_addr,
            http_addr,
            password: SharedSecret::new(password),
            limits: StreamLimits {
                max_width: max_width.max(1),
                max_height: max_height.max(1),
                default_fps: clamp_fps(fps),
                default_quality: clamp_quality(quality),
            },
            monitor,
            max_sessions: max_sessions.max(1),
            auth_timeout: (auth_timeout_secs > 0).then(|| Duration::from_secs(auth_timeout_secs)),
        }
    }

    /// Config for tests and embedding: defaults everywhere
    pub fn with_password(password: &str) -> Self {
        Self::new(
            "127.0.0.1:0".to_string(),
            "127.0.0.1:0".to_string(),
            password.to_string(),
            crate::screen::DEFAULT_FPS,
            crate::screen::DEFAULT_MAX_WIDTH,
            crate::screen::DEFAULT_MAX_HEIGHT,
            crate::screen::DEFAULT_QUALITY,
            0,
            16,
            30,
        )
    }
}
