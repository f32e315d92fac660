pub mod twiml;
pub mod webhook;
pub mod ws;

use crate::app::AppState;
use axum::routing::{get, post};
use axum::Router;

/// Routes the carrier talks to: three HTTP callbacks plus the media-stream
/// socket.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/incoming-call", post(webhook::incoming_call))
        .route("/webhook/transfer-complete", post(webhook::transfer_complete))
        .route("/webhook/call-status", post(webhook::call_status))
        .route("/media-stream/{call_id}", get(ws::media_stream_handler))
}
