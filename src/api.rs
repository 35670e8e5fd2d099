use crate::config::RunConfig;
use crate::state::StatusReport;
use crate::supervisor::{ControlError, RunSupervisor};
use axum::{
    body::Bytes,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

pub fn router(supervisor: RunSupervisor) -> Router {
    Router::new()
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/status", get(get_status))
        .route("/ws", get(telemetry))
        .with_state(supervisor)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

fn bad_request(error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody { error, field: None }),
    )
        .into_response()
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, field) = match &self {
            ControlError::Validation(e) => (StatusCode::BAD_REQUEST, Some(e.field)),
            ControlError::AlreadyRunning | ControlError::ConfigurationLocked => {
                (StatusCode::CONFLICT, None)
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                field,
            }),
        )
            .into_response()
    }
}

async fn get_config(State(supervisor): State<RunSupervisor>) -> Json<RunConfig> {
    Json(supervisor.configuration())
}

async fn set_config(
    State(supervisor): State<RunSupervisor>,
    body: Result<Json<RunConfig>, JsonRejection>,
) -> Response {
    let Json(config) = match body {
        Ok(config) => config,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match supervisor.set_configuration(config) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Starts with the stored configuration, or with the one in the request body
/// if there is one.
async fn start(State(supervisor): State<RunSupervisor>, body: Bytes) -> Response {
    let result = if body.iter().all(u8::is_ascii_whitespace) {
        supervisor.start_current()
    } else {
        match serde_json::from_slice::<RunConfig>(&body) {
            Ok(config) => supervisor.start(config),
            Err(e) => return bad_request(format!("malformed configuration: {e}")),
        }
    };
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop(State(supervisor): State<RunSupervisor>) -> StatusCode {
    supervisor.stop().await;
    StatusCode::OK
}

async fn get_status(State(supervisor): State<RunSupervisor>) -> Json<StatusReport> {
    Json(supervisor.status())
}

async fn telemetry(ws: WebSocketUpgrade, State(supervisor): State<RunSupervisor>) -> Response {
    ws.on_upgrade(move |socket: WebSocket| async move {
        if let Err(error) = telemetry_interface(socket, supervisor).await {
            debug!(%error, "Telemetry subscriber closed with error");
        }
    })
}

/// One subscriber: state dump, then the live stream. Text frames from the
/// client are configuration updates.
async fn telemetry_interface(ws: WebSocket, supervisor: RunSupervisor) -> anyhow::Result<()> {
    let (mut tx, mut rx) = ws.split();
    let mut subscription = supervisor.subscribe();
    info!(
        subscribers = supervisor.subscriber_count(),
        "Telemetry subscriber connected"
    );

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let text = serde_json::to_string(&event)?;
                tx.send(Message::Text(text)).await?;
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => apply_config_message(&supervisor, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket error");
                    break;
                }
            }
        }
    }

    info!("Telemetry subscriber disconnected");
    Ok(())
}

fn apply_config_message(supervisor: &RunSupervisor, text: &str) {
    let config = match serde_json::from_str::<RunConfig>(text) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed configuration message");
            return;
        }
    };
    if let Err(e) = supervisor.set_configuration(config) {
        warn!(error = %e, "Configuration message rejected");
    }
}
