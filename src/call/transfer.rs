use super::registry::{CallRegistry, RegistryError};
use crate::config::TransferConfig;
use crate::event::{CallEvent, EventSender};
use crate::media::MediaSocketHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Close reason handed to the carrier; the close itself is the transfer
/// signal, there is no separate transfer API.
pub const TRANSFER_CLOSE_REASON: &str = "call-transfer";

/// Named states of a transfer in flight. One transfer walks
/// Active -> Draining -> SocketClosing -> AwaitingCarrierCallback ->
/// Retired. The phases are log markers over a linear control flow; the
/// actual guards are `arm_transfer` (one pending record per call) and the
/// forward-only socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Active,
    Draining,
    SocketClosing,
    AwaitingCarrierCallback,
    Retired,
    Aborted,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransferError {
    /// Transfer requested before the call id or media stream are known.
    #[error("call is not ready to be transferred")]
    NotReady,
    /// A transfer is already in flight; the second request is rejected, not
    /// queued.
    #[error("a transfer is already in progress")]
    AlreadyPending,
    /// No live socket to close.
    #[error("no live media socket for this call")]
    SocketUnavailable,
}

/// Result fed back to the AI persona as the `transfer_call` tool output.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }
}

/// Spoken fallback the persona is instructed to use whenever a transfer
/// cannot be completed; the caller must never get silence or a hard drop.
const FALLBACK_MESSAGE: &str = "The transfer could not be completed. Apologize to the caller \
     and offer to take a message or schedule a callback instead. Do not retry the transfer.";

/// Drives one call through the transfer protocol: arm the pending record,
/// drain the in-flight announcement, close the media socket so the carrier
/// invokes its callback, then wait (bounded) for the close acknowledgment.
pub struct TransferCoordinator {
    registry: CallRegistry,
    config: TransferConfig,
    event_sender: EventSender,
}

impl TransferCoordinator {
    pub fn new(registry: CallRegistry, config: TransferConfig, event_sender: EventSender) -> Self {
        Self {
            registry,
            config,
            event_sender,
        }
    }

    /// Entry point for the `transfer_call` tool. Validates and arms
    /// synchronously so a conflicting request fails fast, then lets the
    /// drain/close sequence run in the background while the persona speaks
    /// its announcement; the grace period covers the playback.
    pub fn transfer_call(self: &Arc<Self>, call_id: &str, target_address: &str) -> ToolResult {
        match self.arm(call_id, target_address) {
            Ok(socket) => {
                let coordinator = self.clone();
                let call_id = call_id.to_string();
                let target = target_address.to_string();
                tokio::spawn(async move {
                    coordinator.drain_and_close(&call_id, &target, socket).await;
                });
                ToolResult::ok(format!(
                    "Transfer to {} started. Tell the caller you are transferring them now \
                     and that the line may click briefly.",
                    target_address
                ))
            }
            Err(e) => {
                warn!(call_id, target_address, %e, "transfer request rejected");
                ToolResult::failed(FALLBACK_MESSAGE, e)
            }
        }
    }

    /// Active -> Draining. Preconditions first, then the arm: a call with no
    /// media stream is rejected before any state changes.
    fn arm(&self, call_id: &str, target_address: &str) -> Result<MediaSocketHandle, TransferError> {
        let state = self.registry.get(call_id).ok_or(TransferError::NotReady)?;
        if state.media_stream_id.is_none() {
            return Err(TransferError::NotReady);
        }
        let socket = state.socket.ok_or(TransferError::SocketUnavailable)?;

        self.registry
            .arm_transfer(call_id, target_address)
            .map_err(|e| match e {
                RegistryError::AlreadyPending(_) => TransferError::AlreadyPending,
                RegistryError::NotFound(_) => TransferError::NotReady,
            })?;

        self.transition(call_id, TransferPhase::Active, TransferPhase::Draining);
        self.event_sender
            .send(CallEvent::TransferArmed {
                call_id: call_id.to_string(),
                target: target_address.to_string(),
                timestamp: crate::get_timestamp(),
            })
            .ok();
        Ok(socket)
    }

    /// Draining -> SocketClosing -> AwaitingCarrierCallback. Both waits are
    /// time-bounded and degrade to proceed-anyway: the carrier invokes its
    /// callback from its own observation of the closed connection, whether
    /// or not we saw the close locally.
    async fn drain_and_close(&self, call_id: &str, target_address: &str, socket: MediaSocketHandle) {
        sleep(Duration::from_millis(self.config.drain_grace_ms)).await;

        self.transition(call_id, TransferPhase::Draining, TransferPhase::SocketClosing);
        if let Err(e) = socket.close(TRANSFER_CLOSE_REASON) {
            warn!(call_id, %e, "could not close media socket, aborting transfer");
            self.abort(call_id, TransferPhase::SocketClosing);
            return;
        }

        self.transition(
            call_id,
            TransferPhase::SocketClosing,
            TransferPhase::AwaitingCarrierCallback,
        );
        let timeout = Duration::from_millis(self.config.close_ack_timeout_ms);
        if !socket.wait_closed(timeout).await {
            warn!(
                call_id,
                ?timeout,
                "no close acknowledgment from carrier socket, proceeding anyway"
            );
        }
        info!(
            call_id,
            target_address, "media socket released, awaiting carrier callback"
        );
    }

    /// AwaitingCarrierCallback -> Retired. Invoked by the webhook gateway
    /// after the carrier's callback consumed the pending record.
    pub fn retire(&self, call_id: &str) {
        self.transition(
            call_id,
            TransferPhase::AwaitingCarrierCallback,
            TransferPhase::Retired,
        );
    }

    /// Anything that fails after arming disarms the pending record and asks
    /// the persona to fall back, so the carrier callback cannot redirect a
    /// call whose socket never went down.
    fn abort(&self, call_id: &str, from: TransferPhase) {
        self.transition(call_id, from, TransferPhase::Aborted);
        self.registry.consume_transfer(call_id);
        self.event_sender
            .send(CallEvent::Error {
                call_id: call_id.to_string(),
                message: "transfer aborted".to_string(),
                timestamp: crate::get_timestamp(),
            })
            .ok();
        if let Some(session) = self.registry.session(call_id) {
            session.prompt(FALLBACK_MESSAGE).ok();
        }
    }

    fn transition(&self, call_id: &str, from: TransferPhase, to: TransferPhase) {
        debug!(call_id, ?from, ?to, "transfer phase");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SocketCommand;
    use tokio::sync::{broadcast, mpsc, watch};

    fn coordinator(
        drain_grace_ms: u64,
    ) -> (Arc<TransferCoordinator>, CallRegistry, EventSender) {
        let registry = CallRegistry::new();
        let (event_sender, _) = broadcast::channel(16);
        let config = TransferConfig {
            drain_grace_ms,
            close_ack_timeout_ms: 20,
        };
        let coordinator = Arc::new(TransferCoordinator::new(
            registry.clone(),
            config,
            event_sender.clone(),
        ));
        (coordinator, registry, event_sender)
    }

    fn socket() -> (
        MediaSocketHandle,
        mpsc::UnboundedReceiver<SocketCommand>,
        watch::Sender<bool>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        (MediaSocketHandle::new(cmd_tx, closed_rx), cmd_rx, closed_tx)
    }

    #[tokio::test]
    async fn test_transfer_without_media_leaves_no_partial_state() {
        let (coordinator, registry, _) = coordinator(5);
        registry.register("CA123", None, None);

        let result = coordinator.transfer_call("CA123", "+390200000000");
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), TransferError::NotReady.to_string());
        assert!(registry.get("CA123").unwrap().pending_transfer.is_none());
    }

    #[tokio::test]
    async fn test_transfer_unknown_call_not_ready() {
        let (coordinator, _, _) = coordinator(5);
        let result = coordinator.transfer_call("CA404", "+390200000000");
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), TransferError::NotReady.to_string());
    }

    #[tokio::test]
    async fn test_transfer_arms_then_closes_within_grace() {
        let (coordinator, registry, _) = coordinator(10);
        registry.register("CA123", None, None);
        let (handle, mut cmd_rx, closed_tx) = socket();
        handle.set_stream_sid("MZ1".to_string());
        registry
            .attach_media("CA123", "MZ1".to_string(), handle.clone())
            .unwrap();

        let result = coordinator.transfer_call("CA123", "+39021111111");
        assert!(result.success);
        let pending = registry.get("CA123").unwrap().pending_transfer.unwrap();
        assert_eq!(pending.target_address, "+39021111111");

        // the close command lands after the drain grace
        let cmd = tokio::time::timeout(Duration::from_millis(200), cmd_rx.recv())
            .await
            .expect("close within grace")
            .unwrap();
        match cmd {
            SocketCommand::Close { reason } => assert_eq!(reason, TRANSFER_CLOSE_REASON),
            other => panic!("unexpected command: {:?}", other),
        }
        assert_ne!(handle.state(), crate::media::SocketState::Open);
        closed_tx.send(true).ok();

        // the pending record survives for the carrier callback
        assert!(registry.get("CA123").unwrap().pending_transfer.is_some());
    }

    #[tokio::test]
    async fn test_second_transfer_rejected_while_pending() {
        let (coordinator, registry, _) = coordinator(50);
        registry.register("CA123", None, None);
        let (handle, _cmd_rx, _closed_tx) = socket();
        registry
            .attach_media("CA123", "MZ1".to_string(), handle)
            .unwrap();

        assert!(coordinator.transfer_call("CA123", "+39021111111").success);
        let second = coordinator.transfer_call("CA123", "+39022222222");
        assert!(!second.success);
        assert_eq!(
            second.error.unwrap(),
            TransferError::AlreadyPending.to_string()
        );
        // the original target is untouched
        assert_eq!(
            registry
                .get("CA123")
                .unwrap()
                .pending_transfer
                .unwrap()
                .target_address,
            "+39021111111"
        );
    }

    #[tokio::test]
    async fn test_close_ack_timeout_proceeds_anyway() {
        let (coordinator, registry, _) = coordinator(1);
        registry.register("CA123", None, None);
        let (handle, mut cmd_rx, _closed_tx) = socket();
        registry
            .attach_media("CA123", "MZ1".to_string(), handle)
            .unwrap();

        assert!(coordinator.transfer_call("CA123", "+39021111111").success);
        // never acknowledge the close; the pending record must still be
        // there for the carrier callback once the timeout elapses
        tokio::time::timeout(Duration::from_millis(200), cmd_rx.recv())
            .await
            .expect("close command")
            .unwrap();
        sleep(Duration::from_millis(60)).await;
        assert!(registry.get("CA123").unwrap().pending_transfer.is_some());
    }
}
