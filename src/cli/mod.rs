use clap::{Args, Parser, Subcommand};

use crate::config::{ServerConfig, INSECURE_DEFAULT_PASSWORD};
use crate::screen::{DEFAULT_FPS, DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH, DEFAULT_QUALITY};

#[derive(Parser)]
#[command(name = "screencast")]
#[command(about = "📺 Password-protected screen streaming server", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the streaming server (WebSocket + HTTP/WebRTC)
    Serve(ServeArgs),

    /// List capturable monitors
    Monitors,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// WebSocket listen address
    #[arg(long, env = "SCREENCAST_WS_ADDR", default_value = "0.0.0.0:8081")]
    pub ws_addr: String,

    /// HTTP listen address (/health, /offer)
    #[arg(long, env = "SCREENCAST_HTTP_ADDR", default_value = "0.0.0.0:8082")]
    pub http_addr: String,

    /// Shared viewer password
    #[arg(long, env = "REMOTE_PASSWORD", default_value = INSECURE_DEFAULT_PASSWORD, hide_env_values = true)]
    pub password: String,

    /// Default frames per second
    #[arg(long, env = "SCREENCAST_FPS", default_value_t = DEFAULT_FPS)]
    pub fps: u32,

    /// Largest width a viewer may request
    #[arg(long, env = "SCREENCAST_MAX_WIDTH", default_value_t = DEFAULT_MAX_WIDTH)]
    pub max_width: u32,

    /// Largest height a viewer may request
    #[arg(long, env = "SCREENCAST_MAX_HEIGHT", default_value_t = DEFAULT_MAX_HEIGHT)]
    pub max_height: u32,

    /// Default JPEG quality (1-100)
    #[arg(short, long, env = "SCREENCAST_QUALITY", default_value_t = DEFAULT_QUALITY)]
    pub quality: u32,

    /// Monitor index to capture (see `screencast monitors`)
    #[arg(short, long, env = "SCREENCAST_MONITOR", default_value_t = 0)]
    pub monitor: usize,

    /// Concurrent sessions across both transports
    #[arg(long, env = "SCREENCAST_MAX_SESSIONS", default_value_t = 16)]
    pub max_sessions: usize,

    /// Seconds an unauthenticated WebSocket may idle (0 disables)
    #[arg(long, env = "SCREENCAST_AUTH_TIMEOUT", default_value_t = 30)]
    pub auth_timeout_secs: u64,
}

impl ServeArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig::new(
            self.ws_addr,
            self.http_addr,
            self.password,
            self.fps,
            self.max_width,
            self.max_height,
            self.quality,
            self.monitor,
            self.max_sessions,
            self.auth_timeout_secs,
        )
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["screencast", "serve", "--password", "pw"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config();
        assert_eq!(config.limits.default_fps, 30);
        assert_eq!((config.limits.max_width, config.limits.max_height), (1280, 720));
        assert_eq!(config.limits.default_quality, 60);
        assert_eq!(config.max_sessions, 16);
        assert_eq!(config.auth_timeout, Some(Duration::from_secs(30)));
        assert!(config.password.matches("pw"));
    }

    #[test]
    fn test_serve_out_of_range_values_are_clamped() {
        let cli = Cli::try_parse_from([
            "screencast",
            "serve",
            "--password",
            "pw",
            "--fps",
            "500",
            "--quality",
            "0",
            "--auth-timeout-secs",
            "0",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config();
        assert_eq!(config.limits.default_fps, 60);
        assert_eq!(config.limits.default_quality, 1);
        assert_eq!(config.auth_timeout, None);
    }

    #[test]
    fn test_monitors_subcommand() {
        let cli = Cli::try_parse_from(["screencast", "monitors"]).unwrap();
        assert!(matches!(cli.command, Commands::Monitors));
    }
}
