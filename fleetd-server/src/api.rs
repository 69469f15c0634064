use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fleetd_core::descriptor::Component;
use fleetd_core::error::FleetError;
use fleetd_core::ipc::{
    EmbedRequest, EmbedResponse, ExtractedFile, ImportResponse, InspectResponse,
};
use std::sync::Arc;

use crate::manager::Fleet;
use crate::transport::payload::{EmbeddedPayload, PayloadFile};
use crate::transport::{archive, png};

/// The dashboard-facing router. Verbs only; everything interesting happens
/// in the manager and the transport codec.
pub fn router(fleet: Fleet) -> Router {
    let body_limit = fleet.config().max_import_bytes;
    Router::new()
        .route("/projects", get(handle_list))
        .route("/projects/rescan", post(handle_rescan))
        .route("/projects/start-all", post(handle_start_all))
        .route("/projects/stop-all", post(handle_stop_all))
        .route("/projects/:name/:component/start", post(handle_start))
        .route("/projects/:name/:component/stop", post(handle_stop))
        .route("/projects/:name/:component/restart", post(handle_restart))
        .route("/ports", get(handle_ports))
        .route("/import", post(handle_import))
        .route("/transport/embed", post(handle_embed))
        .route("/transport/extract", post(handle_extract))
        .route("/transport/inspect", post(handle_inspect))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(fleet))
}

struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn internal(e: anyhow::Error) -> Self {
        Self(FleetError::Io(std::io::Error::other(format!("{e:#}"))))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::ProjectNotFound(_) | FleetError::NotEmbedded => StatusCode::NOT_FOUND,
            FleetError::UnknownComponent(_)
            | FleetError::ConfigParse { .. }
            | FleetError::MissingManifest { .. }
            | FleetError::ArchiveTooLarge { .. }
            | FleetError::InvalidArchive
            | FleetError::InvalidContainerFormat(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

fn parse_component(raw: &str) -> Result<Component, ApiError> {
    raw.parse::<Component>().map_err(ApiError::from)
}

async fn handle_list(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.list().await)
}

async fn handle_rescan(State(fleet): State<Arc<Fleet>>) -> Result<impl IntoResponse, ApiError> {
    fleet.rescan().await.map_err(ApiError::internal)?;
    Ok(Json(fleet.list().await))
}

async fn handle_start_all(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.start_all().await)
}

async fn handle_stop_all(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.stop_all().await)
}

async fn handle_start(
    State(fleet): State<Arc<Fleet>>,
    Path((name, component)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let component = parse_component(&component)?;
    fleet.start(&name, component).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_stop(
    State(fleet): State<Arc<Fleet>>,
    Path((name, component)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let component = parse_component(&component)?;
    fleet.stop(&name, component).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_restart(
    State(fleet): State<Arc<Fleet>>,
    Path((name, component)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let component = parse_component(&component)?;
    fleet.restart(&name, component).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_ports(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.port_table().await)
}

async fn handle_import(
    State(fleet): State<Arc<Fleet>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = fleet.import_archive(&body).await?;
    Ok(Json(ImportResponse {
        project: outcome.project,
        backed_up_to: outcome.backed_up_to,
    }))
}

async fn handle_embed(
    State(fleet): State<Arc<Fleet>>,
    Json(request): Json<EmbedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let container = BASE64
        .decode(&request.image_base64)
        .map_err(|e| FleetError::InvalidContainerFormat(format!("image base64: {e}")))?;
    let archive_bytes = BASE64
        .decode(&request.archive_base64)
        .map_err(|_| FleetError::InvalidArchive)?;
    archive::validate(&archive_bytes, fleet.config())?;

    let payload = EmbeddedPayload {
        files: vec![PayloadFile::new("project.tar.gz", archive_bytes)],
    };
    let embedded = png::embed(&container, &payload)?;
    Ok(Json(EmbedResponse {
        image_base64: BASE64.encode(embedded),
    }))
}

async fn handle_extract(body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let payload = png::extract(&body)?;
    let files: Vec<ExtractedFile> = payload
        .files
        .iter()
        .map(|f| ExtractedFile {
            path: f.relative_path.clone(),
            tag: f.tag.to_string(),
            size: f.content.len() as u64,
            content_base64: BASE64.encode(&f.content),
        })
        .collect();
    Ok(Json(files))
}

async fn handle_inspect(body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let files = png::inspect(&body)?;
    Ok(Json(InspectResponse {
        embedded: files.is_some(),
        files: files.unwrap_or_default(),
    }))
}
