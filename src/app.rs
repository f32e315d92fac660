use crate::call::{CallRegistry, CallState, TransferCoordinator};
use crate::callrecord::{CallDisposition, CallRecord, CallRecordManager, CallRecordSender};
use crate::config::Config;
use crate::event::{CallEvent, EventSender};
use anyhow::Result;
use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub registry: CallRegistry,
    pub transfer: Arc<TransferCoordinator>,
    pub event_sender: EventSender,
    pub callrecord_sender: CallRecordSender,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub registry: Option<CallRegistry>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: CallRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();
        let registry = self.registry.unwrap_or_default();
        let (event_sender, _) = broadcast::channel(128);

        let callrecord_manager =
            CallRecordManager::new(token.child_token(), config.callrecord.clone());
        let callrecord_sender = callrecord_manager.sender.clone();
        tokio::spawn(callrecord_manager.serve());

        let transfer = Arc::new(TransferCoordinator::new(
            registry.clone(),
            config.transfer.clone(),
            event_sender.clone(),
        ));

        Ok(Arc::new(AppStateInner {
            config,
            token,
            registry,
            transfer,
            event_sender,
            callrecord_sender,
        }))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateInner {
    /// The media-stream URL handed to the carrier in the incoming-call
    /// answer.
    pub fn stream_url(&self, call_id: &str) -> String {
        format!(
            "wss://{}/media-stream/{}",
            self.config.public_host, call_id
        )
    }

    /// Build and queue the persisted record for a finished call. Storage
    /// failures are logged, never surfaced to the carrier.
    pub fn finalize_call(&self, state: CallState, disposition: CallDisposition) {
        let reason = disposition.describe();
        let end_time = Utc::now();
        let duration_secs = (end_time - state.started_at).num_seconds().max(0) as u64;
        let record = CallRecord {
            call_id: state.call_id.clone(),
            caller: state.caller,
            callee: state.called,
            start_time: state.started_at,
            end_time,
            duration_secs,
            disposition,
        };
        if let Err(e) = self.callrecord_sender.send(record) {
            error!(call_id = state.call_id, "failed to queue call record: {}", e);
        }
        self.event_sender
            .send(CallEvent::CallEnded {
                call_id: state.call_id,
                reason,
                timestamp: crate::get_timestamp(),
            })
            .ok();
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on {}", addr);

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    crate::handler::router().with_state(state).layer(cors)
}
