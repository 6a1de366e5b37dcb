use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::{ApiError, ApiJson, ApiPath, ApiResult, AppState};
use crate::db::{self, Reorderable};
use crate::model::{Group, GroupInput, ReorderEntry};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/groups", get(list).post(create))
        .route("/api/groups/reorder", put(reorder))
        .route("/api/groups/:id", get(show).put(update).delete(remove))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Group>>> {
    Ok(Json(db::list_groups(&state.pool).await?))
}

async fn show(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Group>> {
    db::get_group(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))
}

async fn create(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<GroupInput>,
) -> ApiResult<(StatusCode, Json<Group>)> {
    let group = db::create_group(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<GroupInput>,
) -> ApiResult<Json<Group>> {
    Ok(Json(db::update_group(&state.pool, id, &input).await?))
}

async fn remove(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    db::delete_group(&state.pool, id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn reorder(
    State(state): State<AppState>,
    ApiJson(entries): ApiJson<Vec<ReorderEntry>>,
) -> ApiResult<Json<Value>> {
    db::reorder(&state.pool, Reorderable::Groups, &entries).await?;
    Ok(Json(json!({ "success": true, "updated": entries.len() })))
}
