use super::persona::Persona;
use crate::config::RealtimeConfig;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The upstream realtime provider could not be reached; the one fatal
/// condition for a call.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("realtime api key is not configured")]
    MissingApiKey,
    #[error("invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to reach realtime provider: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Events we send to the realtime provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdateConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: serde_json::Value },
    #[serde(rename = "response.create")]
    ResponseCreate {},
    #[serde(rename = "response.cancel")]
    ResponseCancel {},
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdateConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: serde_json::Value,
    pub tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl SessionUpdateConfig {
    /// Carrier audio is G.711 mu-law; the session speaks the same format so
    /// payloads pass through base64-verbatim in both directions.
    pub fn for_persona(config: &RealtimeConfig, persona: &Persona) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: persona.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: "g711_ulaw".to_string(),
            output_audio_format: "g711_ulaw".to_string(),
            turn_detection: json!({ "type": "server_vad" }),
            tools: persona.tools.clone(),
            temperature: config.temperature,
        }
    }
}

/// Events the realtime provider sends us. Only the ones the orchestrator
/// consumes are typed; everything else folds into `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone {},
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "error")]
    Error { error: ProviderError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderError {
    pub r#type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Cloneable handle kept in the call registry; lets other components speak
/// to the session or stop it without owning the event stream.
#[derive(Clone)]
pub struct SessionHandle {
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    /// Inject a system turn and ask for a response; used to steer the
    /// persona when something outside the conversation failed.
    pub fn prompt(&self, text: &str) -> Result<()> {
        self.client_tx.send(ClientEvent::ItemCreate {
            item: json!({
                "type": "message",
                "role": "system",
                "content": [{ "type": "input_text", "text": text }]
            }),
        })?;
        self.client_tx.send(ClientEvent::ResponseCreate {})?;
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

/// One realtime AI session, bound to exactly one call. Owns the provider
/// WebSocket through two pump tasks; the server-event receiver goes to the
/// orchestrator.
pub struct RealtimeSession {
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    cancel_token: CancellationToken,
}

impl RealtimeSession {
    pub async fn connect(
        config: &RealtimeConfig,
        cancel_token: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ConnectError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or(ConnectError::MissingApiKey)?;

        let url = format!("{}?model={}", config.endpoint, config.model);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|_| ConnectError::InvalidEndpoint(url))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| ConnectError::MissingApiKey)?;
        request.headers_mut().insert(http::header::AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (event_tx, events) = mpsc::unbounded_channel::<ServerEvent>();

        let writer_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = writer_token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    event = client_rx.recv() => match event {
                        Some(event) => {
                            let text = match serde_json::to_string(&event) {
                                Ok(text) => text,
                                Err(e) => {
                                    error!("failed to serialize client event: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                warn!("provider socket write failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        });

        let reader_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = reader_token.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if event_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => debug!("unparsed provider event: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("provider socket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            }
            // dropping event_tx ends the orchestrator's event stream
        });

        Ok((
            Self {
                client_tx,
                cancel_token,
            },
            events,
        ))
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            client_tx: self.client_tx.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }

    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.client_tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("realtime session is gone"))
    }

    pub fn update_session(&self, config: &RealtimeConfig, persona: &Persona) -> Result<()> {
        self.send(ClientEvent::SessionUpdate {
            session: SessionUpdateConfig::for_persona(config, persona),
        })
    }

    pub fn append_audio(&self, payload: String) -> Result<()> {
        self.send(ClientEvent::InputAudioAppend { audio: payload })
    }

    pub fn create_response(&self) -> Result<()> {
        self.send(ClientEvent::ResponseCreate {})
    }

    pub fn cancel_response(&self) -> Result<()> {
        self.send(ClientEvent::ResponseCancel {})
    }

    pub fn send_tool_output<T: Serialize>(&self, tool_call_id: &str, output: &T) -> Result<()> {
        self.send(ClientEvent::ItemCreate {
            item: json!({
                "type": "function_call_output",
                "call_id": tool_call_id,
                "output": serde_json::to_string(output)?,
            }),
        })
    }

    /// Synthetic first turn: the carrier connects audio before any caller
    /// speech exists, so the agent has to speak first.
    pub fn trigger_initial_utterance(&self) -> Result<()> {
        self.send(ClientEvent::ItemCreate {
            item: json!({
                "type": "message",
                "role": "user",
                "content": [{
                    "type": "input_text",
                    "text": "Greet the caller and ask how you can help."
                }]
            }),
        })?;
        self.send(ClientEvent::ResponseCreate {})
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::persona;

    #[test]
    fn test_client_event_wire_format() {
        let append = serde_json::to_string(&ClientEvent::InputAudioAppend {
            audio: "AAAA".to_string(),
        })
        .unwrap();
        assert!(append.contains(r#""type":"input_audio_buffer.append""#));
        assert!(append.contains(r#""audio":"AAAA""#));

        let config = RealtimeConfig::default();
        let targets = vec![persona::FINANCIAL_SPECIALIST.to_string()];
        let update = serde_json::to_string(&ClientEvent::SessionUpdate {
            session: SessionUpdateConfig::for_persona(&config, &persona::receptionist(&targets)),
        })
        .unwrap();
        assert!(update.contains(r#""type":"session.update""#));
        assert!(update.contains(r#""input_audio_format":"g711_ulaw""#));
        assert!(update.contains(r#""name":"transfer_call""#));
    }

    #[test]
    fn test_server_event_parsing() {
        let delta: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","response_id":"r1","delta":"AAAA"}"#,
        )
        .unwrap();
        assert!(matches!(delta, ServerEvent::AudioDelta { delta } if delta == "AAAA"));

        let tool: ServerEvent = serde_json::from_str(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1",
                "name":"transfer_call","arguments":"{\"target_address\":\"+39\"}"}"#,
        )
        .unwrap();
        match tool {
            ServerEvent::FunctionCallDone { call_id, name, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "transfer_call");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let error: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"nope"}}"#,
        )
        .unwrap();
        match error {
            ServerEvent::Error { error } => assert_eq!(error.message.unwrap(), "nope"),
            other => panic!("unexpected event: {:?}", other),
        }

        // events this crate does not consume are tolerated, not errors
        let other: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(other, ServerEvent::Other));
    }
}
