use crate::agent::SessionHandle;
use crate::media::MediaSocketHandle;
use crate::{CallId, StreamId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("no active call with id {0}")]
    NotFound(CallId),
    #[error("a transfer is already pending for call {0}")]
    AlreadyPending(CallId),
}

/// One in-progress call. Owned exclusively by the registry for the lifetime
/// of the call; handlers get clones of the handles, never the entry itself.
#[derive(Clone)]
pub struct CallState {
    pub call_id: CallId,
    pub caller: Option<String>,
    pub called: Option<String>,
    /// Required before any operation that signals the carrier.
    pub media_stream_id: Option<StreamId>,
    pub socket: Option<MediaSocketHandle>,
    pub session: Option<SessionHandle>,
    pub pending_transfer: Option<PendingTransfer>,
    pub started_at: DateTime<Utc>,
}

impl CallState {
    fn new(call_id: CallId, caller: Option<String>, called: Option<String>) -> Self {
        Self {
            call_id,
            caller,
            called,
            media_stream_id: None,
            socket: None,
            session: None,
            pending_transfer: None,
            started_at: Utc::now(),
        }
    }
}

/// Present only between a transfer being armed and the carrier's callback
/// consuming it. Armed at most once per call, read at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransfer {
    pub target_address: String,
    pub armed_at: DateTime<Utc>,
}

/// Process-wide store of active calls, injected wherever call state is
/// touched. Every mutation holds the lock for the duration of the whole
/// operation and never awaits, so two callbacks racing on the same call id
/// serialize on the lock.
#[derive(Clone)]
pub struct CallRegistry {
    calls: Arc<Mutex<HashMap<CallId, CallState>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert an empty entry for a new call. A duplicate register is a
    /// logged no-op, the existing entry stays untouched.
    pub fn register(&self, call_id: &str, caller: Option<String>, called: Option<String>) -> bool {
        let mut calls = self.calls.lock().unwrap();
        if calls.contains_key(call_id) {
            warn!(call_id, "call already registered, ignoring");
            return false;
        }
        info!(call_id, caller, called, "call registered");
        calls.insert(
            call_id.to_string(),
            CallState::new(call_id.to_string(), caller, called),
        );
        true
    }

    pub fn attach_media(
        &self,
        call_id: &str,
        media_stream_id: StreamId,
        socket: MediaSocketHandle,
    ) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock().unwrap();
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))?;
        debug!(call_id, media_stream_id, "media attached");
        state.media_stream_id = Some(media_stream_id);
        state.socket = Some(socket);
        Ok(())
    }

    pub fn attach_session(
        &self,
        call_id: &str,
        session: SessionHandle,
    ) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock().unwrap();
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))?;
        debug!(call_id, "realtime session attached");
        state.session = Some(session);
        Ok(())
    }

    /// Arm a pending transfer. A second arm while one is in flight is
    /// rejected, not queued.
    pub fn arm_transfer(&self, call_id: &str, target_address: &str) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock().unwrap();
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))?;
        if state.pending_transfer.is_some() {
            return Err(RegistryError::AlreadyPending(call_id.to_string()));
        }
        info!(call_id, target_address, "transfer armed");
        state.pending_transfer = Some(PendingTransfer {
            target_address: target_address.to_string(),
            armed_at: Utc::now(),
        });
        Ok(())
    }

    /// Atomically read and clear the pending transfer. The single
    /// synchronization point between the socket-close path and the carrier's
    /// callback: whichever caller gets here first wins, a pending record is
    /// never read twice.
    pub fn consume_transfer(&self, call_id: &str) -> Option<PendingTransfer> {
        let mut calls = self.calls.lock().unwrap();
        calls
            .get_mut(call_id)
            .and_then(|state| state.pending_transfer.take())
    }

    /// Remove the entry. Safe on an already-missing key.
    pub fn remove(&self, call_id: &str) -> Option<CallState> {
        let removed = self.calls.lock().unwrap().remove(call_id);
        if removed.is_some() {
            info!(call_id, "call removed from registry");
        }
        removed
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.lock().unwrap().contains_key(call_id)
    }

    pub fn get(&self, call_id: &str) -> Option<CallState> {
        self.calls.lock().unwrap().get(call_id).cloned()
    }

    pub fn socket(&self, call_id: &str) -> Option<MediaSocketHandle> {
        self.calls
            .lock()
            .unwrap()
            .get(call_id)
            .and_then(|s| s.socket.clone())
    }

    pub fn session(&self, call_id: &str) -> Option<SessionHandle> {
        self.calls
            .lock()
            .unwrap()
            .get(call_id)
            .and_then(|s| s.session.clone())
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, watch};

    fn test_socket() -> MediaSocketHandle {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = watch::channel(false);
        MediaSocketHandle::new(cmd_tx, closed_rx)
    }

    #[test]
    fn test_register_twice_is_noop() {
        let registry = CallRegistry::new();
        assert!(registry.register("CA123", Some("+3901".into()), None));
        assert!(!registry.register("CA123", Some("+3999".into()), None));
        assert_eq!(registry.len(), 1);
        // the original entry is unchanged
        assert_eq!(registry.get("CA123").unwrap().caller.unwrap(), "+3901");
    }

    #[test]
    fn test_arm_transfer_requires_entry() {
        let registry = CallRegistry::new();
        assert_eq!(
            registry.arm_transfer("CA404", "+390200000000"),
            Err(RegistryError::NotFound("CA404".to_string()))
        );
    }

    #[test]
    fn test_arm_transfer_rejects_second_arm() {
        let registry = CallRegistry::new();
        registry.register("CA123", None, None);
        registry.arm_transfer("CA123", "+390200000000").unwrap();
        assert_eq!(
            registry.arm_transfer("CA123", "+390211111111"),
            Err(RegistryError::AlreadyPending("CA123".to_string()))
        );
        // the first target stays armed
        let pending = registry.get("CA123").unwrap().pending_transfer.unwrap();
        assert_eq!(pending.target_address, "+390200000000");
    }

    #[test]
    fn test_consume_transfer_is_destructive() {
        let registry = CallRegistry::new();
        registry.register("CA123", None, None);
        registry.arm_transfer("CA123", "+390200000000").unwrap();

        let first = registry.consume_transfer("CA123").unwrap();
        assert_eq!(first.target_address, "+390200000000");
        assert!(registry.consume_transfer("CA123").is_none());
    }

    #[test]
    fn test_consume_transfer_never_armed() {
        let registry = CallRegistry::new();
        registry.register("CA123", None, None);
        assert!(registry.consume_transfer("CA123").is_none());
        assert!(registry.consume_transfer("CA404").is_none());
    }

    #[test]
    fn test_attach_media_requires_entry() {
        let registry = CallRegistry::new();
        assert!(matches!(
            registry.attach_media("CA404", "MZ1".to_string(), test_socket()),
            Err(RegistryError::NotFound(_))
        ));

        registry.register("CA123", None, None);
        registry
            .attach_media("CA123", "MZ1".to_string(), test_socket())
            .unwrap();
        let state = registry.get("CA123").unwrap();
        assert_eq!(state.media_stream_id.unwrap(), "MZ1");
        assert!(state.socket.is_some());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = CallRegistry::new();
        registry.register("CA123", None, None);
        assert!(registry.remove("CA123").is_some());
        assert!(registry.remove("CA123").is_none());
    }
}
