use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Frames the carrier sends over the media-stream socket. JSON with an
/// `event` discriminator; audio payloads are base64 G.711 mu-law.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CarrierFrame {
    Connected {
        protocol: Option<String>,
        version: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop {},
    /// Control events this adapter does not consume (e.g. dtmf); ignored,
    /// not treated as malformed.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// base64 encoded audio
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Frames we send back to the carrier on the same socket.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundFrame {
    Media {
        stream_sid: String,
        media: MediaPayload,
    },
    /// Mark request, echoed back by the carrier once the audio queued before
    /// it has been played out
    Mark {
        stream_sid: String,
        mark: MarkPayload,
    },
    /// Drop any audio the carrier has buffered but not yet played
    Clear {
        stream_sid: String,
    },
}

impl OutboundFrame {
    pub fn media(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        OutboundFrame::Media {
            stream_sid: stream_sid.into(),
            media: MediaPayload {
                payload: payload.into(),
                timestamp: None,
                track: None,
            },
        }
    }

    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        OutboundFrame::Mark {
            stream_sid: stream_sid.into(),
            mark: MarkPayload { name: name.into() },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        OutboundFrame::Clear {
            stream_sid: stream_sid.into(),
        }
    }
}
