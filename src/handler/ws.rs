use crate::agent::{RealtimeSession, SessionOrchestrator};
use crate::app::AppState;
use crate::callrecord::CallDisposition;
use crate::media::{
    InboundFrameHandler, MediaEvent, MediaSocketHandle, SocketCommand, SocketState,
};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Carrier media-stream socket handler
pub async fn media_stream_handler(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.registry.contains(&call_id) {
        warn!(call_id, "media stream opened for unknown call");
        return ws.on_upgrade(move |socket| handle_unknown_call(socket, call_id));
    }
    ws.on_upgrade(move |socket| handle_media_stream(socket, state, call_id))
}

async fn handle_unknown_call(mut socket: WebSocket, call_id: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: format!("unknown call {}", call_id).into(),
        })))
        .await;
}

/// One task per call: connect the realtime session, hand the orchestrator
/// its two event streams, then pump the carrier socket until either side is
/// done.
async fn handle_media_stream(mut socket: WebSocket, state: AppState, call_id: String) {
    let cancel_token = state.token.child_token();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let handle = MediaSocketHandle::new(cmd_tx, closed_rx);
    let (media_tx, media_rx) = mpsc::unbounded_channel();

    let (session, server_rx) =
        match RealtimeSession::connect(&state.config.realtime, cancel_token.child_token()).await {
            Ok(pair) => pair,
            Err(e) => {
                // the one fatal condition: without the provider the call
                // cannot proceed, close the leg cleanly
                error!(call_id, %e, "cannot reach realtime provider, ending call");
                if let Some(call) = state.registry.remove(&call_id) {
                    state.finalize_call(
                        call,
                        CallDisposition::Failed {
                            reason: "realtime provider unreachable".to_string(),
                        },
                    );
                }
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: "provider unavailable".into(),
                    })))
                    .await;
                return;
            }
        };

    if let Err(e) = state.registry.attach_session(&call_id, session.handle()) {
        warn!(call_id, %e, "call vanished before session attach");
        session.stop();
        return;
    }

    let orchestrator = SessionOrchestrator::new(
        state.clone(),
        call_id.clone(),
        handle.clone(),
        cancel_token.child_token(),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run(session, server_rx, media_rx));

    pump_socket(
        socket,
        &state,
        &call_id,
        handle.clone(),
        cmd_rx,
        media_tx,
        closed_tx,
        cancel_token.clone(),
    )
    .await;

    handle.advance(SocketState::Closed);
    cancel_token.cancel();
    orchestrator_task.await.ok();
    // the registry entry outlives the socket on purpose: the carrier's
    // transfer-complete or call-status callback retires it
    info!(call_id, "media stream finished");
}

/// Owns the WebSocket halves. Inbound text frames go through the
/// malformed-frame gate and on to the orchestrator; outbound commands come
/// from whoever holds the socket handle. After a close command the loop
/// stays alive only to observe the carrier's close acknowledgment.
#[allow(clippy::too_many_arguments)]
async fn pump_socket(
    socket: WebSocket,
    state: &AppState,
    call_id: &str,
    handle: MediaSocketHandle,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    closed_tx: watch::Sender<bool>,
    cancel_token: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut inbound = InboundFrameHandler::new(call_id);

    loop {
        select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match inbound.on_text(&text) {
                        Ok(Some(event)) => {
                            if let MediaEvent::Started { media_stream_id, .. } = &event {
                                handle.set_stream_sid(media_stream_id.clone());
                                if let Err(e) = state.registry.attach_media(
                                    call_id,
                                    media_stream_id.clone(),
                                    handle.clone(),
                                ) {
                                    warn!(call_id, %e, "failed to attach media to registry");
                                }
                            }
                            media_tx.send(event).ok();
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(call_id, %e, "forcing media socket closure");
                            handle.advance(SocketState::Closing);
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::PROTOCOL,
                                    reason: "protocol error".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(call_id, "carrier closed media socket");
                    break;
                }
                Some(Err(e)) => {
                    warn!(call_id, "media socket error: {}", e);
                    break;
                }
                None => break,
                _ => {}
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Frame(frame)) => {
                    if handle.state() != SocketState::Open {
                        continue;
                    }
                    match serde_json::to_string(&frame) {
                        Ok(text) => {
                            if let Err(e) = sender.send(Message::Text(text.into())).await {
                                warn!(call_id, "media socket write failed: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!(call_id, "failed to serialize outbound frame: {}", e);
                        }
                    }
                }
                Some(SocketCommand::Close { reason }) => {
                    info!(call_id, reason, "closing media socket");
                    handle.advance(SocketState::Closing);
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    // keep looping until the carrier acknowledges or the
                    // connection drops
                }
                None => break,
            },
            _ = cancel_token.cancelled() => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    handle.advance(SocketState::Closed);
    let _ = closed_tx.send(true);
}
