use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::warn;
use tunergate_core::admission::AdmissionError;
use tunergate_core::clock::Clock;
use tunergate_core::metrics::Metrics;
use tunergate_core::pipeline::{PipelineAdapter, PipelineError, PipelineHealth};
use tunergate_core::preflight::PreflightReason;
use tunergate_core::recordings::{Lifecycle, LifecyclePolicy, RecordingPaths};
use tunergate_core::sessions::orchestrator::OrchestratorError;
use tunergate_core::sessions::store::StoreError;
use tunergate_core::sessions::{SessionOrchestrator, SessionRecord, StopReason};
use tunergate_core::stream::{
    ClientCaps, Mode, OutputFormat, Profile, QualityProfile, Source, SourceKind, StreamSpec,
};

pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub adapter: Arc<PipelineAdapter>,
    pub recordings: Arc<RecordingPaths>,
    pub lifecycle: LifecyclePolicy,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub idle_timeout_secs: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
            OrchestratorError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::Store(StoreError::InvalidTransition { .. }) => {
                StatusCode::CONFLICT
            }
            OrchestratorError::Admission(AdmissionError::NoCapacity) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Admission(AdmissionError::Rejected) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Pipeline(p) => match p {
                PipelineError::InvalidSessionId | PipelineError::DeadlineTooShort => {
                    StatusCode::BAD_REQUEST
                }
                PipelineError::Preflight(PreflightReason::Timeout) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                PipelineError::Preflight(_) => StatusCode::BAD_GATEWAY,
                PipelineError::Rejected(_)
                | PipelineError::HwRequestedUnavailable
                | PipelineError::EncoderNotVerified(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PipelineError::RecordingPath(_) => StatusCode::BAD_REQUEST,
                PipelineError::Upstream(msg) if msg.contains("circuit-open") => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
                PipelineError::StartFailure(_) | PipelineError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        };
        ApiError {
            status,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    session_id: String,
    #[serde(default = "default_mode")]
    mode: Mode,
    /// Service reference, recording reference or raw URL
    source: String,
    #[serde(default = "default_source_kind")]
    kind: SourceKind,
    tuner_slot: Option<u32>,
    #[serde(default = "default_quality")]
    quality: QualityProfile,
    #[serde(default = "default_output_format")]
    output_format: OutputFormat,
    client: Option<ClientCaps>,
}

fn default_mode() -> Mode {
    Mode::Live
}

fn default_source_kind() -> SourceKind {
    SourceKind::Tuner
}

fn default_quality() -> QualityProfile {
    QualityProfile::Standard
}

fn default_output_format() -> OutputFormat {
    OutputFormat::HlsTs
}

#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    record: SessionRecord,
    health: Option<PipelineHealth>,
    playlist: Option<String>,
}

pub fn router(state: Arc<AppState>, output_dir: &str) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(start_session))
        .route(
            "/api/v1/sessions/{id}",
            get(get_session).delete(stop_session),
        )
        .route("/api/v1/recordings/resolve", get(resolve_recording))
        .route("/metrics", get(metrics))
        .nest_service("/hls", ServeDir::new(output_dir))
        .layer(cors)
        .with_state(state)
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionView>> {
    let sessions = state
        .orchestrator
        .store()
        .list_active(state.idle_timeout_secs)
        .into_iter()
        .map(|record| view_of(&state, record))
        .collect();
    Json(sessions)
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let spec = StreamSpec {
        session_id: req.session_id,
        mode: req.mode,
        output_format: req.output_format,
        quality: req.quality,
        source: Source {
            kind: req.kind,
            identifier: req.source,
            tuner_slot: req.tuner_slot,
        },
        profile: Profile::for_quality(req.quality),
        client: req.client,
        load: None,
    };
    let record = state
        .orchestrator
        .start_session(spec, HashMap::new(), None)
        .await?;
    Ok((StatusCode::CREATED, Json(view_of(&state, record))))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let record = state.orchestrator.store().get(&id).ok_or(ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("session not found: {id}"),
    })?;
    if let Err(e) = state.orchestrator.store().touch(&id) {
        warn!(session_id = %id, error = %e, "failed to refresh last-access");
    }
    Ok(Json(view_of(&state, record)))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let record = state
        .orchestrator
        .stop_session(&id, StopReason::ClientRequest)
        .await?;
    Ok(Json(view_of(&state, record)))
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    #[serde(rename = "ref")]
    service_ref: String,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    path: String,
    lifecycle: Lifecycle,
}

async fn resolve_recording(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let path = state
        .recordings
        .resolve_existing(&q.service_ref)
        .map_err(|e| ApiError {
            status: StatusCode::NOT_FOUND,
            message: e.to_string(),
        })?;
    let lifecycle = state
        .lifecycle
        .classify(&path, state.clock.as_ref())
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?;
    Ok(Json(ResolveResponse {
        path: path.display().to_string(),
        lifecycle,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut out = Vec::new();
    encoder
        .encode(&state.metrics.registry().gather(), &mut out)
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?;
    String::from_utf8(out).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
    })
}

fn view_of(state: &AppState, record: SessionRecord) -> SessionView {
    let health = state
        .orchestrator
        .handle_of(&record.id)
        .map(|h| state.adapter.health(&h));
    let playlist = (!record.state.is_terminal())
        .then(|| format!("/hls/sessions/{}/stream.m3u8", record.id));
    SessionView {
        record,
        health,
        playlist,
    }
}
