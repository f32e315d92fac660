use super::twiml;
use crate::app::AppState;
use crate::callrecord::CallDisposition;
use axum::extract::{Form, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

/// Form-encoded body the carrier posts to every callback. Field names are
/// the carrier's, hence the PascalCase renames.
#[derive(Debug, Deserialize, Default)]
pub struct CarrierCallbackParams {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "To")]
    pub to: Option<String>,
    #[serde(rename = "CallStatus")]
    pub call_status: Option<String>,
    #[serde(rename = "CallDuration")]
    pub call_duration: Option<String>,
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

/// A new call rang in. Register it and tell the carrier to connect the leg
/// to our media socket; everything else happens once the stream starts.
pub async fn incoming_call(
    State(state): State<AppState>,
    Form(params): Form<CarrierCallbackParams>,
) -> Response {
    info!(
        call_id = params.call_sid,
        caller = params.from,
        called = params.to,
        "incoming call"
    );
    state
        .registry
        .register(&params.call_sid, params.from, params.to);
    xml_response(twiml::connect_stream(&state.stream_url(&params.call_sid)))
}

/// The carrier observed our socket close and is asking what to do with the
/// call leg. A pending transfer answers with a redirect exactly once; no
/// pending record is not an error (normal completion lands here too in some
/// carrier configurations) and gets a safe hang-up.
pub async fn transfer_complete(
    State(state): State<AppState>,
    Form(params): Form<CarrierCallbackParams>,
) -> Response {
    match state.registry.consume_transfer(&params.call_sid) {
        Some(pending) => {
            info!(
                call_id = params.call_sid,
                target = pending.target_address,
                "redirecting call leg to transfer target"
            );
            state.transfer.retire(&params.call_sid);
            if let Some(call) = state.registry.remove(&params.call_sid) {
                if let Some(session) = &call.session {
                    session.stop();
                }
                state.finalize_call(
                    call,
                    CallDisposition::Transferred {
                        target: pending.target_address.clone(),
                    },
                );
            }
            xml_response(twiml::redirect(&pending.target_address))
        }
        None => {
            info!(
                call_id = params.call_sid,
                "no pending transfer, answering with hangup"
            );
            xml_response(twiml::hangup())
        }
    }
}

/// Fire-and-forget lifecycle notification. Terminal states retire the
/// registry entry and feed the storage collaborator; the carrier does not
/// expect a meaningful body.
pub async fn call_status(
    State(state): State<AppState>,
    Form(params): Form<CarrierCallbackParams>,
) -> StatusCode {
    let status = params.call_status.clone().unwrap_or_default();
    info!(
        call_id = params.call_sid,
        status,
        duration = params.call_duration,
        "carrier status callback"
    );
    if matches!(
        status.as_str(),
        "completed" | "failed" | "busy" | "no-answer" | "canceled"
    ) {
        if let Some(call) = state.registry.remove(&params.call_sid) {
            if let Some(session) = &call.session {
                session.stop();
            }
            if let Some(socket) = &call.socket {
                if socket.close("call ended").is_err() {
                    warn!(call_id = params.call_sid, "media socket already gone");
                }
            }
            let disposition = if status == "completed" {
                CallDisposition::Completed
            } else {
                CallDisposition::Failed { reason: status }
            };
            state.finalize_call(call, disposition);
        }
    }
    StatusCode::OK
}
