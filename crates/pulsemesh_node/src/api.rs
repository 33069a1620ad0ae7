//! REST status API (spec §6 hosts "no CLI surface is specified for the
//! core; hosts wrap it" — this is that wrapping). Grounded on the teacher's
//! `run_api_server`: same axum + CORS-any layout, same `/health` and
//! `/api/status` shape; the brain/stats/analytics endpoints (ML-specific,
//! no counterpart here) are dropped in favour of federation status.

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::daemon::DaemonManager;
use crate::federation::FederationHandle;

#[derive(Clone)]
pub struct ApiState {
    pub federation: Option<FederationHandle>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    running: bool,
    pid: Option<u32>,
    metrics: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
pub struct FederationStatusResponse {
    peer_count: usize,
    active_requests: usize,
    local_emotion: pulsemesh_core::vector::EmotionalScalars,
}

#[derive(Deserialize)]
pub struct ConsensusRequestBody {
    prompt: String,
    system: Option<String>,
    #[serde(default)]
    history: Vec<String>,
    min_participants: Option<usize>,
    timeout_secs: Option<f64>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status() -> Json<StatusResponse> {
    let pid_file = DaemonManager::pid_file();
    let state_file = DaemonManager::state_file();

    let (running, pid) = if let Ok(content) = std::fs::read_to_string(&pid_file) {
        if let Ok(pid_val) = content.trim().parse::<u32>() {
            let s = sysinfo::System::new_all();
            let pid_obj = sysinfo::Pid::from(pid_val as usize);
            (s.process(pid_obj).is_some(), Some(pid_val))
        } else {
            (false, None)
        }
    } else {
        (false, None)
    };

    let metrics = if running {
        std::fs::read_to_string(&state_file)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    } else {
        None
    };

    Json(StatusResponse { running, pid, metrics })
}

async fn start_node() -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    match DaemonManager::start() {
        Ok(_) => Ok(Json(StatusResponse {
            running: true,
            pid: None,
            metrics: None,
        })),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() }))),
    }
}

async fn stop_node() -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    match DaemonManager::stop() {
        Ok(_) => Ok(Json(StatusResponse {
            running: false,
            pid: None,
            metrics: None,
        })),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() }))),
    }
}

async fn request_consensus(
    State(state): State<ApiState>,
    Json(body): Json<ConsensusRequestBody>,
) -> Result<Json<pulsemesh_core::consensus::ConsensusResult>, (StatusCode, Json<ErrorResponse>)> {
    let Some(federation) = &state.federation else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: "federation node is not running".into() }),
        ));
    };

    let args = crate::federation::RequestConsensusArgs {
        prompt: body.prompt,
        system: body.system,
        history: body.history,
        min_participants: body.min_participants.unwrap_or(1),
        timeout: std::time::Duration::from_secs_f64(body.timeout_secs.unwrap_or(5.0)),
        method: pulsemesh_core::consensus::ConsensusMethod::WeightedConfidence,
    };

    federation
        .request_consensus(args)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() })))
}

async fn get_federation_status(
    State(state): State<ApiState>,
) -> Result<Json<FederationStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(federation) = &state.federation else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: "federation node is not running".into() }),
        ));
    };
    let Some(snapshot) = federation.snapshot().await else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: "coordinator did not respond".into() }),
        ));
    };
    Ok(Json(FederationStatusResponse {
        peer_count: snapshot.peer_table.len(),
        active_requests: snapshot.active_requests,
        local_emotion: *snapshot.local_emotion.scalars(),
    }))
}

async fn get_config() -> Json<crate::config::Config> {
    match crate::config::Config::load() {
        Ok(config) => Json(config),
        Err(_) => Json(crate::config::Config::default()),
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/node/start", post(start_node))
        .route("/api/node/stop", post(stop_node))
        .route("/api/consensus", post(request_consensus))
        .route("/api/federation", get(get_federation_status))
        .route("/api/config", get(get_config))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn run_api_server(port: u16, federation: Option<FederationHandle>) -> anyhow::Result<()> {
    let app = router(ApiState { federation });

    let addr = if std::env::var("PULSEMESH_PUBLIC").is_ok() {
        format!("0.0.0.0:{port}")
    } else {
        format!("127.0.0.1:{port}")
    };
    info!(%addr, "api server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
