use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::{ApiError, ApiJson, ApiPath, ApiResult, AppState};
use crate::db;
use crate::model::{Note, NoteInput};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/notes", get(list).post(create))
        .route("/api/notes/:id", get(show).put(update).delete(remove))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Note>>> {
    Ok(Json(db::list_notes(&state.pool).await?))
}

async fn show(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Note>> {
    db::get_note(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("note {} not found", id)))
}

async fn create(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<NoteInput>,
) -> ApiResult<(StatusCode, Json<Note>)> {
    let note = db::create_note(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<NoteInput>,
) -> ApiResult<Json<Note>> {
    Ok(Json(db::update_note(&state.pool, id, &input).await?))
}

async fn remove(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    db::delete_note(&state.pool, id).await?;
    Ok(Json(json!({ "success": true })))
}
