//! HTTP control surface.
//!
//! Local-only axum server used by `doris-ctl` and the chat front end:
//! start/cancel turns and adjust volume and speed while speaking.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clip::TurnId;
use crate::config::OllamaConfig;
use crate::control::ControlSnapshot;
use crate::orchestrator::Orchestrator;
use crate::source::{OllamaSource, StaticSource};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub ollama: OllamaConfig,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct SpeakRequest {
    text: String,
}

#[derive(Deserialize)]
struct AskRequest {
    prompt: String,
}

#[derive(Deserialize)]
struct VolumeRequest {
    volume: i64,
}

#[derive(Deserialize)]
struct SpeedRequest {
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    level: Option<u8>,
}

#[derive(Serialize)]
struct StatusResponse {
    speaking: bool,
    active_turn: Option<TurnId>,
    pending_clips: usize,
    controls: ControlSnapshot,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<TurnId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    controls: Option<ControlSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            turn: None,
            controls: None,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::ok("error")
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/speak", post(handle_speak))
        .route("/ask", post(handle_ask))
        .route("/cancel", post(handle_cancel))
        .route("/volume", post(handle_volume))
        .route("/speed", post(handle_speed))
        .with_state(state)
}

/// Start the control API as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return;
        }
    };
    info!("Control API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        speaking: orchestrator.playback().is_playing(),
        active_turn: orchestrator.active_turn(),
        pending_clips: orchestrator.playback().pending_len(),
        controls: orchestrator.controls().snapshot(),
    })
}

async fn handle_speak(State(state): State<ApiState>, Json(req): Json<SpeakRequest>) -> Json<SimpleResponse> {
    if req.text.trim().is_empty() {
        return Json(SimpleResponse::err("empty text"));
    }

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.len(),
    );

    let turn = state.orchestrator.start_turn(StaticSource::text(req.text));
    Json(SimpleResponse {
        turn: Some(turn),
        ..SimpleResponse::ok("speaking")
    })
}

async fn handle_ask(State(state): State<ApiState>, Json(req): Json<AskRequest>) -> Json<SimpleResponse> {
    if req.prompt.trim().is_empty() {
        return Json(SimpleResponse::err("empty prompt"));
    }

    let source = match OllamaSource::new(&state.ollama, &req.prompt) {
        Ok(source) => source,
        Err(e) => return Json(SimpleResponse::err(e.to_string())),
    };
    info!("HTTP /ask: {} chars to {}", req.prompt.len(), state.ollama.model);

    let turn = state.orchestrator.start_turn(source);
    Json(SimpleResponse {
        turn: Some(turn),
        ..SimpleResponse::ok("speaking")
    })
}

async fn handle_cancel(State(state): State<ApiState>) -> Json<SimpleResponse> {
    match state.orchestrator.cancel_turn() {
        Some(turn) => Json(SimpleResponse {
            turn: Some(turn),
            ..SimpleResponse::ok("cancelled")
        }),
        None => Json(SimpleResponse::ok("idle")),
    }
}

async fn handle_volume(State(state): State<ApiState>, Json(req): Json<VolumeRequest>) -> Json<SimpleResponse> {
    let controls = state.orchestrator.controls();
    let volume = controls.set_volume(req.volume);
    info!("Volume set to {volume}");
    Json(SimpleResponse {
        controls: Some(controls.snapshot()),
        ..SimpleResponse::ok("ok")
    })
}

async fn handle_speed(State(state): State<ApiState>, Json(req): Json<SpeedRequest>) -> Json<SimpleResponse> {
    let controls = state.orchestrator.controls();
    let speed = match (req.level, req.speed) {
        (Some(level), _) => controls.set_speed_level(level),
        (None, Some(speed)) => controls.set_speed(speed),
        (None, None) => return Json(SimpleResponse::err("expected `speed` or `level`")),
    };
    info!("Speed set to {speed}x");
    Json(SimpleResponse {
        controls: Some(controls.snapshot()),
        ..SimpleResponse::ok("ok")
    })
}
