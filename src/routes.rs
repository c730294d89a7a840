use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::error::ApiError;
use crate::image_data::EncodedImage;
use crate::session::{SessionController, SessionSnapshot};

const UPLOAD_FAILED: &str = "Could not read the uploaded image.";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
}

pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    let api_routes = Router::new()
        .route("/session", get(get_session))
        .route("/image", post(upload_image).delete(clear_image))
        .route("/analyze", post(analyze))
        .route("/prompt", get(get_prompt))
        .route("/history/:id/select", post(select_history))
        .route("/reset", post(reset))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    Router::new()
        .route("/", get(index))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.controller.snapshot().await)
}

async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|err| {
            warn!(error = %err, "malformed upload");
            ApiError::BadRequest(UPLOAD_FAILED.to_string())
        })?
        .ok_or_else(|| ApiError::BadRequest("No file in upload.".to_string()))?;

    let declared_mime = field.content_type().map(str::to_string);
    let data = field.bytes().await.map_err(|err| {
        warn!(error = %err, "failed to read upload");
        ApiError::BadRequest(UPLOAD_FAILED.to_string())
    })?;

    let image = EncodedImage::from_bytes(&data, declared_mime.as_deref()).map_err(|err| {
        warn!(error = %err, declared_mime = ?declared_mime, "rejected upload");
        ApiError::BadRequest(UPLOAD_FAILED.to_string())
    })?;

    Ok(Json(state.controller.select_image(image).await))
}

async fn clear_image(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.controller.clear_image().await)
}

async fn analyze(State(state): State<AppState>) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .controller
        .analyze()
        .await
        .map(Json)
        .map_err(|rejected| ApiError::Conflict(rejected.to_string()))
}

async fn get_prompt(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .controller
        .current_prompt()
        .await
        .ok_or_else(|| ApiError::NotFound("No prompt to copy.".to_string()))
}

async fn select_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .controller
        .select_history(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No history item {id}.")))
}

/// Returns the fresh session. If an analysis is still outstanding the
/// snapshot keeps `isAnalyzing: true` until that request returns; its
/// response is then discarded.
async fn reset(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.controller.reset().await)
}
