use super::protocol::{CarrierFrame, OutboundFrame};
use crate::StreamId;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Consecutive malformed frames tolerated before the socket is force-closed.
pub const MALFORMED_FRAME_TOLERANCE: usize = 3;
/// Malformed frames older than this no longer count toward the tolerance.
pub const MALFORMED_FRAME_WINDOW: Duration = Duration::from_secs(10);

/// Raised when the carrier sends malformed frames beyond tolerance; forces
/// socket closure.
#[derive(Debug, Error)]
#[error("{count} consecutive malformed carrier frames within {window:?}")]
pub struct ProtocolError {
    pub count: usize,
    pub window: Duration,
}

/// Typed notifications the adapter surfaces to the session orchestrator.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Started {
        media_stream_id: StreamId,
        call_id: String,
    },
    /// base64 inbound audio, forwarded verbatim to the realtime session
    Audio {
        payload: String,
    },
    /// The carrier played out everything queued before the named mark
    Mark {
        name: String,
    },
    Stopped,
}

/// Commands the socket pump consumes on behalf of handle holders.
#[derive(Debug)]
pub enum SocketCommand {
    Frame(OutboundFrame),
    /// Close the underlying transport with a normal-closure code and the
    /// given reason. This is the only signal the carrier gets that the call
    /// leg should be released for redirection.
    Close { reason: String },
}

/// Socket lifecycle. Transitions are forward-only: a socket is never
/// reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocketState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SocketState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SocketState::Open,
            1 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

#[derive(Debug, Error)]
#[error("media socket is not available")]
pub struct SocketUnavailable;

/// Cloneable handle over the live carrier socket. The actual WebSocket half
/// stays with the pump task; holders interact through commands and observe
/// the close acknowledgment through a watch channel.
#[derive(Clone)]
pub struct MediaSocketHandle {
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
    state: Arc<AtomicU8>,
    stream_sid: Arc<OnceLock<StreamId>>,
    closed_rx: watch::Receiver<bool>,
}

impl MediaSocketHandle {
    pub fn new(
        cmd_tx: mpsc::UnboundedSender<SocketCommand>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cmd_tx,
            state: Arc::new(AtomicU8::new(SocketState::Open as u8)),
            stream_sid: Arc::new(OnceLock::new()),
            closed_rx,
        }
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Forward-only state advance; a later state never regresses.
    pub fn advance(&self, next: SocketState) {
        self.state.fetch_max(next as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Set once when the carrier's start frame arrives.
    pub fn set_stream_sid(&self, stream_sid: StreamId) {
        let _ = self.stream_sid.set(stream_sid);
    }

    pub fn stream_sid(&self) -> Option<&StreamId> {
        self.stream_sid.get()
    }

    fn send(&self, cmd: SocketCommand) -> Result<(), SocketUnavailable> {
        self.cmd_tx.send(cmd).map_err(|_| SocketUnavailable)
    }

    /// Queue outbound audio. Silently refused once the socket leaves Open so
    /// no frame is forwarded after a close began.
    pub fn send_media(&self, payload: impl Into<String>) -> Result<(), SocketUnavailable> {
        if !self.is_open() {
            return Err(SocketUnavailable);
        }
        let sid = self.stream_sid.get().ok_or(SocketUnavailable)?.clone();
        self.send(SocketCommand::Frame(OutboundFrame::media(sid, payload)))
    }

    pub fn send_mark(&self, name: impl Into<String>) -> Result<(), SocketUnavailable> {
        if !self.is_open() {
            return Err(SocketUnavailable);
        }
        let sid = self.stream_sid.get().ok_or(SocketUnavailable)?.clone();
        self.send(SocketCommand::Frame(OutboundFrame::mark(sid, name)))
    }

    pub fn send_clear(&self) -> Result<(), SocketUnavailable> {
        if !self.is_open() {
            return Err(SocketUnavailable);
        }
        let sid = self.stream_sid.get().ok_or(SocketUnavailable)?.clone();
        self.send(SocketCommand::Frame(OutboundFrame::clear(sid)))
    }

    /// Ask the pump to close the transport. Idempotent: a second close on a
    /// socket already past Open is a no-op.
    pub fn close(&self, reason: impl Into<String>) -> Result<(), SocketUnavailable> {
        if !self.is_open() {
            return Ok(());
        }
        self.advance(SocketState::Closing);
        self.send(SocketCommand::Close {
            reason: reason.into(),
        })
    }

    /// Wait until the pump observed the transport closed, bounded by
    /// `timeout`. Returns false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.closed_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // pump gone, the transport is certainly down
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Translates raw carrier frames into [`MediaEvent`]s and tracks the
/// malformed-frame tolerance. Owned by the socket pump; kept separate so the
/// escalation policy is testable without a live socket.
pub struct InboundFrameHandler {
    call_id: String,
    malformed_count: usize,
    malformed_since: Option<Instant>,
}

impl InboundFrameHandler {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            malformed_count: 0,
            malformed_since: None,
        }
    }

    /// Handle one text frame from the carrier. `Ok(None)` means the frame
    /// carried nothing the orchestrator needs (or was dropped as line
    /// noise); `Err` means the tolerance was exceeded and the socket must be
    /// force-closed.
    pub fn on_text(&mut self, text: &str) -> Result<Option<MediaEvent>, ProtocolError> {
        let frame: CarrierFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return self.on_malformed(e),
        };
        self.malformed_count = 0;
        self.malformed_since = None;

        let event = match frame {
            CarrierFrame::Connected { .. } => {
                debug!(call_id = self.call_id, "carrier media socket connected");
                None
            }
            CarrierFrame::Start { stream_sid, start } => {
                if start.call_sid != self.call_id {
                    warn!(
                        call_id = self.call_id,
                        frame_call_id = start.call_sid,
                        "start frame carries a different call id"
                    );
                }
                Some(MediaEvent::Started {
                    media_stream_id: stream_sid,
                    call_id: start.call_sid,
                })
            }
            CarrierFrame::Media { media } => Some(MediaEvent::Audio {
                payload: media.payload,
            }),
            CarrierFrame::Mark { mark } => Some(MediaEvent::Mark { name: mark.name }),
            CarrierFrame::Stop {} => Some(MediaEvent::Stopped),
            CarrierFrame::Unknown => None,
        };
        Ok(event)
    }

    /// A single bad frame is dropped and logged to tolerate line noise, but
    /// a run of them within the window escalates.
    fn on_malformed(
        &mut self,
        error: serde_json::Error,
    ) -> Result<Option<MediaEvent>, ProtocolError> {
        let now = Instant::now();
        match self.malformed_since {
            Some(since) if now.duration_since(since) <= MALFORMED_FRAME_WINDOW => {
                self.malformed_count += 1;
            }
            _ => {
                self.malformed_since = Some(now);
                self.malformed_count = 1;
            }
        }
        warn!(
            call_id = self.call_id,
            count = self.malformed_count,
            "dropping malformed carrier frame: {}",
            error
        );
        if self.malformed_count >= MALFORMED_FRAME_TOLERANCE {
            return Err(ProtocolError {
                count: self.malformed_count,
                window: MALFORMED_FRAME_WINDOW,
            });
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> (
        MediaSocketHandle,
        mpsc::UnboundedReceiver<SocketCommand>,
        watch::Sender<bool>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        (MediaSocketHandle::new(cmd_tx, closed_rx), cmd_rx, closed_tx)
    }

    #[test]
    fn test_state_is_forward_only() {
        let (handle, _cmd_rx, _closed_tx) = test_handle();
        assert_eq!(handle.state(), SocketState::Open);
        handle.advance(SocketState::Closed);
        handle.advance(SocketState::Closing);
        assert_eq!(handle.state(), SocketState::Closed);
    }

    #[test]
    fn test_no_media_after_close() {
        let (handle, mut cmd_rx, _closed_tx) = test_handle();
        handle.set_stream_sid("MZ1".to_string());
        handle.send_media("AAAA").unwrap();
        handle.close("transfer").unwrap();
        assert!(handle.send_media("BBBB").is_err());

        assert!(matches!(
            cmd_rx.try_recv().unwrap(),
            SocketCommand::Frame(OutboundFrame::Media { .. })
        ));
        assert!(matches!(
            cmd_rx.try_recv().unwrap(),
            SocketCommand::Close { .. }
        ));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn test_media_requires_stream_sid() {
        let (handle, _cmd_rx, _closed_tx) = test_handle();
        assert!(handle.send_media("AAAA").is_err());
    }

    #[tokio::test]
    async fn test_wait_closed_ack_and_timeout() {
        let (handle, _cmd_rx, closed_tx) = test_handle();
        assert!(!handle.wait_closed(Duration::from_millis(20)).await);

        closed_tx.send(true).unwrap();
        assert!(handle.wait_closed(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_three_consecutive_malformed_frames_escalate() {
        let mut handler = InboundFrameHandler::new("CA123");
        assert!(handler.on_text("not json").unwrap().is_none());
        assert!(handler.on_text("{broken").unwrap().is_none());
        let err = handler.on_text("garbage").unwrap_err();
        assert_eq!(err.count, MALFORMED_FRAME_TOLERANCE);
    }

    #[test]
    fn test_good_frame_resets_malformed_run() {
        let mut handler = InboundFrameHandler::new("CA123");
        assert!(handler.on_text("not json").unwrap().is_none());
        assert!(handler.on_text("{broken").unwrap().is_none());
        // a valid frame in between breaks the run
        let event = handler
            .on_text(r#"{"event":"media","media":{"payload":"AAAA"}}"#)
            .unwrap();
        assert!(matches!(event, Some(MediaEvent::Audio { .. })));
        assert!(handler.on_text("garbage").unwrap().is_none());
        assert!(handler.on_text("garbage").unwrap().is_none());
        assert!(handler.on_text("garbage").is_err());
    }

    #[test]
    fn test_stop_frame_surfaces_stopped() {
        let mut handler = InboundFrameHandler::new("CA123");
        let event = handler
            .on_text(r#"{"event":"stop","streamSid":"MZ1"}"#)
            .unwrap();
        assert!(matches!(event, Some(MediaEvent::Stopped)));
    }
}
