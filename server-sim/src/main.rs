//! Development stand-in for the remote backend: the device-facing HTTP
//! endpoints plus an enqueue route so commands can be staged from curl.
//! State is in memory only.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::info;

#[derive(Clone)]
struct AppState {
    backend: Arc<Mutex<Backend>>,
}

#[derive(Default)]
struct Backend {
    next_id: i64,
    pending: Vec<PendingCommand>,
    last_report: Option<serde_json::Value>,
    power: f64,
}

struct PendingCommand {
    id: i64,
    device_id: String,
    kind: String,
    value: Option<f64>,
    acknowledged: bool,
}

#[derive(Debug, Serialize)]
struct CommandView {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    value: Option<f64>,
}

#[derive(Debug, Serialize)]
struct CommandsResponse {
    commands: Vec<CommandView>,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "commandId")]
    command_id: i64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state = AppState {
        backend: Arc::new(Mutex::new(Backend::default())),
    };

    let app = Router::new()
        .route("/api/esp32/data", post(handle_post_data))
        .route(
            "/api/esp32/commands",
            get(handle_get_commands).post(handle_enqueue_command),
        )
        .route("/api/esp32/commands/ack", post(handle_ack_command))
        .route("/api/esp32/power", get(handle_get_power))
        .with_state(state);

    let port = std::env::var("TEMPMON_SERVER_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(4200);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind server-sim at {addr}"))?;

    info!("server-sim listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_post_data(
    State(state): State<AppState>,
    Json(report): Json<serde_json::Value>,
) -> impl IntoResponse {
    let device = report
        .get("deviceId")
        .and_then(|value| value.as_str())
        .unwrap_or("unknown");
    info!("telemetry from {device}: {report}");

    let mut backend = state.backend.lock().await;
    backend.last_report = Some(report);
    Json(serde_json::json!({ "ok": true }))
}

async fn handle_get_commands(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(device_id) = params.get("deviceId") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'deviceId' parameter");
    };

    let backend = state.backend.lock().await;
    let commands = backend
        .pending
        .iter()
        .filter(|command| !command.acknowledged && command.device_id == *device_id)
        .map(|command| CommandView {
            id: command.id,
            kind: command.kind.clone(),
            value: command.value,
        })
        .collect();

    Json(CommandsResponse { commands }).into_response()
}

async fn handle_enqueue_command(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> impl IntoResponse {
    match request.kind.as_str() {
        "servo" => {
            let Some(value) = request.value else {
                return error_response(StatusCode::BAD_REQUEST, "servo command needs a value (0-100)");
            };
            if !(0.0..=100.0).contains(&value) {
                return error_response(StatusCode::BAD_REQUEST, "servo value must be in 0-100");
            }
        }
        "power_on" | "power_off" => {
            if request.value.is_some() {
                return error_response(StatusCode::BAD_REQUEST, "power commands take no value");
            }
        }
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid type. Use 'power_on', 'power_off' or 'servo'",
            )
        }
    }

    let mut backend = state.backend.lock().await;
    backend.next_id += 1;
    let id = backend.next_id;

    match request.kind.as_str() {
        "power_on" => backend.power = 1.0,
        "power_off" => backend.power = 0.0,
        _ => {}
    }

    backend.pending.push(PendingCommand {
        id,
        device_id: request.device_id.clone(),
        kind: request.kind.clone(),
        value: request.value,
        acknowledged: false,
    });
    info!("queued command {id} ({}) for {}", request.kind, request.device_id);

    Json(CommandView {
        id,
        kind: request.kind,
        value: request.value,
    })
    .into_response()
}

async fn handle_ack_command(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> impl IntoResponse {
    let mut backend = state.backend.lock().await;
    let Some(command) = backend
        .pending
        .iter_mut()
        .find(|command| command.id == request.command_id && command.device_id == request.device_id)
    else {
        return error_response(StatusCode::NOT_FOUND, "Command not found");
    };

    command.acknowledged = true;
    info!(
        "command {} acknowledged by {} ({})",
        request.command_id,
        request.device_id,
        request.status.as_deref().unwrap_or("OK")
    );
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn handle_get_power(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.backend.lock().await;
    Json(serde_json::json!({ "power": backend.power }))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
