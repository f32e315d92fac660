use super::persona::{self, Persona};
use super::realtime::{RealtimeSession, ServerEvent};
use crate::app::AppState;
use crate::call::ToolResult;
use crate::event::CallEvent;
use crate::media::{MediaEvent, MediaSocketHandle};
use crate::CallId;
use anyhow::Result;
use serde_json::Value;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bridges one call's media socket and its realtime session: inbound carrier
/// audio becomes session input, session audio becomes outbound frames, and
/// tool invocations drive handoff and transfer. Session-level provider
/// errors are absorbed here; only the session stream ending stops the loop.
pub struct SessionOrchestrator {
    app_state: AppState,
    call_id: CallId,
    socket: MediaSocketHandle,
    cancel_token: CancellationToken,
    persona: Persona,
    handoff_targets: Vec<String>,
}

impl SessionOrchestrator {
    pub fn new(
        app_state: AppState,
        call_id: CallId,
        socket: MediaSocketHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        let handoff_targets = vec![persona::FINANCIAL_SPECIALIST.to_string()];
        let persona = persona::receptionist(&handoff_targets);
        Self {
            app_state,
            call_id,
            socket,
            cancel_token,
            persona,
            handoff_targets,
        }
    }

    pub async fn run(
        mut self,
        session: RealtimeSession,
        mut server_rx: mpsc::UnboundedReceiver<ServerEvent>,
        mut media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Result<()> {
        session.update_session(&self.app_state.config.realtime, &self.persona)?;
        session.trigger_initial_utterance()?;

        let cancel_token = self.cancel_token.clone();
        loop {
            select! {
                event = media_rx.recv() => match event {
                    Some(event) => {
                        if !self.on_media_event(&session, event) {
                            break;
                        }
                    }
                    None => {
                        debug!(call_id = self.call_id, "media stream ended");
                        break;
                    }
                },
                event = server_rx.recv() => match event {
                    Some(event) => self.on_server_event(&session, event),
                    None => {
                        warn!(call_id = self.call_id, "realtime session stream ended");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => {
                    debug!(call_id = self.call_id, "orchestrator cancelled");
                    break;
                }
            }
        }
        session.stop();
        Ok(())
    }

    /// Returns false when the media side is finished and the loop should
    /// stop.
    fn on_media_event(&self, session: &RealtimeSession, event: MediaEvent) -> bool {
        match event {
            MediaEvent::Started {
                media_stream_id, ..
            } => {
                info!(
                    call_id = self.call_id,
                    media_stream_id, "carrier media started"
                );
                self.emit(CallEvent::MediaStarted {
                    call_id: self.call_id.clone(),
                    media_stream_id,
                    timestamp: crate::get_timestamp(),
                });
            }
            MediaEvent::Audio { payload } => {
                if session.append_audio(payload).is_err() {
                    return false;
                }
            }
            MediaEvent::Mark { name } => {
                debug!(call_id = self.call_id, name, "carrier played out mark");
                self.emit(CallEvent::Mark {
                    call_id: self.call_id.clone(),
                    name,
                    timestamp: crate::get_timestamp(),
                });
            }
            MediaEvent::Stopped => {
                self.emit(CallEvent::MediaStopped {
                    call_id: self.call_id.clone(),
                    timestamp: crate::get_timestamp(),
                });
                return false;
            }
        }
        true
    }

    fn on_server_event(&mut self, session: &RealtimeSession, event: ServerEvent) {
        match event {
            ServerEvent::AudioDelta { delta } => {
                // refused once the socket is closing; forwarding must stop
                // the moment a transfer drain began
                self.socket.send_media(delta).ok();
            }
            ServerEvent::AudioDone {} => {
                let name = format!("utterance-{}", uuid::Uuid::new_v4());
                self.socket.send_mark(name).ok();
            }
            ServerEvent::SpeechStarted {} => {
                // barge-in: stop the current response and flush queued audio
                debug!(call_id = self.call_id, "caller started speaking");
                session.cancel_response().ok();
                self.socket.send_clear().ok();
            }
            ServerEvent::FunctionCallDone {
                call_id: tool_call_id,
                name,
                arguments,
            } => {
                self.on_tool_call(session, &tool_call_id, &name, &arguments);
            }
            ServerEvent::Error { error } => {
                // session-level provider errors never take the call down
                warn!(
                    call_id = self.call_id,
                    code = error.code,
                    "provider session error (call continues): {}",
                    error.message.unwrap_or_default()
                );
            }
            ServerEvent::SessionCreated {} => {
                debug!(call_id = self.call_id, "realtime session created");
            }
            ServerEvent::SessionUpdated {} | ServerEvent::ResponseDone {} | ServerEvent::Other => {}
        }
    }

    fn on_tool_call(
        &mut self,
        session: &RealtimeSession,
        tool_call_id: &str,
        name: &str,
        arguments: &str,
    ) {
        info!(
            call_id = self.call_id,
            tool = name,
            arguments,
            "persona invoked tool"
        );
        let args: Value = serde_json::from_str(arguments).unwrap_or(Value::Null);
        let result = match name {
            "transfer_call" => {
                let target = args["target_address"].as_str().unwrap_or_default();
                if target.is_empty() {
                    ToolResult::failed(
                        "No destination number was given. Ask the caller what they need \
                         and offer to take a message instead.",
                        "missing target_address",
                    )
                } else {
                    self.app_state.transfer.transfer_call(&self.call_id, target)
                }
            }
            "handoff" => self.handoff(session, args["target"].as_str().unwrap_or_default()),
            _ => {
                warn!(call_id = self.call_id, tool = name, "unknown tool invoked");
                ToolResult::failed("That action is not available.", "unknown tool")
            }
        };
        session.send_tool_output(tool_call_id, &result).ok();
        // let the persona react to the result out loud
        session.create_response().ok();
    }

    /// In-session persona switch: same session, same socket, new
    /// instructions and tools.
    fn handoff(&mut self, session: &RealtimeSession, target: &str) -> ToolResult {
        if !self.handoff_targets.iter().any(|t| t == target) && target != persona::RECEPTIONIST {
            return ToolResult::failed(
                "That specialist is not available. Continue helping the caller yourself.",
                format!("unknown handoff target: {}", target),
            );
        }
        let next = match persona::by_name(target, &self.handoff_targets) {
            Some(next) => next,
            None => {
                return ToolResult::failed(
                    "That specialist is not available. Continue helping the caller yourself.",
                    format!("unknown handoff target: {}", target),
                )
            }
        };
        if session
            .update_session(&self.app_state.config.realtime, &next)
            .is_err()
        {
            return ToolResult::failed(
                "The handoff could not be completed. Continue helping the caller yourself.",
                "session unavailable",
            );
        }
        info!(
            call_id = self.call_id,
            from = self.persona.name,
            to = next.name,
            "persona handoff"
        );
        self.emit(CallEvent::PersonaChanged {
            call_id: self.call_id.clone(),
            persona: next.name.clone(),
            timestamp: crate::get_timestamp(),
        });
        self.persona = next;
        ToolResult::ok("You are now the active persona; continue the conversation.")
    }

    fn emit(&self, event: CallEvent) {
        self.app_state.event_sender.send(event).ok();
    }
}
