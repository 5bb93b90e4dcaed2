use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StreamError;

/// Numeric settings take any JSON number. Negatives read as 0 and fractions
/// are rounded; range limits are applied where the value is used.
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(|v| v.round().clamp(0.0, u32::MAX as f64) as u32))
}

/// Commands a viewer sends over the message channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ClientCommand {
    Auth {
        #[serde(default)]
        password: String,
    },
    StartStream {
        #[serde(default, deserialize_with = "lenient_u32")]
        width: Option<u32>,
        #[serde(default, deserialize_with = "lenient_u32")]
        height: Option<u32>,
        #[serde(default, deserialize_with = "lenient_u32")]
        fps: Option<u32>,
        #[serde(default, deserialize_with = "lenient_u32")]
        quality: Option<u32>,
    },
    StopStream,
    SetQuality {
        #[serde(default, deserialize_with = "lenient_u32")]
        quality: Option<u32>,
    },
    SetFps {
        #[serde(default, deserialize_with = "lenient_u32")]
        fps: Option<u32>,
    },
}

impl ClientCommand {
    /// Decode one text message. Anything that is not a known command is a protocol error.
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| StreamError::Protocol("Invalid JSON".to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| StreamError::Protocol(format!("Unrecognized command: {}", e)))
    }

    /// Everything except `auth` needs an authenticated session
    pub fn is_privileged(&self) -> bool {
        !matches!(self, ClientCommand::Auth { .. })
    }
}

/// Messages the server pushes to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    AuthRequired,
    AuthSuccess,
    AuthFailed,
    StreamStarted { width: u32, height: u32, fps: u32 },
    StreamStopped,
    Frame {
        /// Base64 JPEG
        data: String,
        /// Unix seconds at capture
        timestamp: f64,
        frame: u64,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(err: &StreamError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// WebRTC offer posted to `/offer`
#[derive(Debug, Clone, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub width: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub height: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub fps: Option<u32>,
}

/// Answer returned for an accepted offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}
