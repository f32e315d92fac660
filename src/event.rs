use serde::{Deserialize, Serialize};

/// CallEvent represents the lifecycle notifications a single call can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum CallEvent {
    /// The carrier opened the audio media session
    MediaStarted {
        call_id: String,
        media_stream_id: String,
        timestamp: u64,
    },
    /// The carrier ended the audio media session
    MediaStopped { call_id: String, timestamp: u64 },
    /// The carrier acknowledged a mark frame we sent
    Mark {
        call_id: String,
        name: String,
        timestamp: u64,
    },
    /// The active persona changed via in-session handoff
    PersonaChanged {
        call_id: String,
        persona: String,
        timestamp: u64,
    },
    /// A transfer was armed and the socket is being drained
    TransferArmed {
        call_id: String,
        target: String,
        timestamp: u64,
    },
    /// The call left the registry
    CallEnded {
        call_id: String,
        reason: String,
        timestamp: u64,
    },
    /// Error event
    Error {
        call_id: String,
        message: String,
        timestamp: u64,
    },
}

impl CallEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            CallEvent::MediaStarted { timestamp, .. } => *timestamp,
            CallEvent::MediaStopped { timestamp, .. } => *timestamp,
            CallEvent::Mark { timestamp, .. } => *timestamp,
            CallEvent::PersonaChanged { timestamp, .. } => *timestamp,
            CallEvent::TransferArmed { timestamp, .. } => *timestamp,
            CallEvent::CallEnded { timestamp, .. } => *timestamp,
            CallEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::MediaStarted { call_id, .. } => call_id,
            CallEvent::MediaStopped { call_id, .. } => call_id,
            CallEvent::Mark { call_id, .. } => call_id,
            CallEvent::PersonaChanged { call_id, .. } => call_id,
            CallEvent::TransferArmed { call_id, .. } => call_id,
            CallEvent::CallEnded { call_id, .. } => call_id,
            CallEvent::Error { call_id, .. } => call_id,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<CallEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<CallEvent>;
