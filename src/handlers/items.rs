use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiJson, ApiPath, ApiQuery, ApiResult, AppState};
use crate::db::{self, Reorderable};
use crate::model::{Item, ItemInput, ReorderEntry};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/items", get(list).post(create))
        .route("/api/items/reorder", put(reorder))
        .route("/api/items/due-soon", get(due_soon))
        .route("/api/items/:id", get(show).put(update).delete(remove))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    group_id: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    Ok(Json(db::list_items(&state.pool, query.group_id).await?))
}

#[derive(Debug, Deserialize)]
struct DueSoonQuery {
    days: Option<i64>,
}

/// Open items due within `days` (default: the `dueSoonDays` setting),
/// overdue ones included.
async fn due_soon(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DueSoonQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    let days = match query.days {
        Some(days) if days < 0 => {
            return Err(ApiError::BadRequest("days must be >= 0".into()));
        }
        Some(days) => days,
        None => db::get_settings(&state.pool).await?.due_soon_days,
    };
    Ok(Json(db::due_soon_items(&state.pool, Utc::now(), days).await?))
}

async fn show(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Item>> {
    db::get_item(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("item {} not found", id)))
}

async fn create(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<ItemInput>,
) -> ApiResult<(StatusCode, Json<Item>)> {
    let item = db::create_item(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<ItemInput>,
) -> ApiResult<Json<Item>> {
    Ok(Json(db::update_item(&state.pool, id, &input).await?))
}

async fn remove(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    db::delete_item(&state.pool, id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn reorder(
    State(state): State<AppState>,
    ApiJson(entries): ApiJson<Vec<ReorderEntry>>,
) -> ApiResult<Json<Value>> {
    db::reorder(&state.pool, Reorderable::Items, &entries).await?;
    Ok(Json(json!({ "success": true, "updated": entries.len() })))
}
