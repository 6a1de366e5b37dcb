use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiJson, ApiPath, ApiQuery, ApiResult, AppState};
use crate::db;
use crate::model::{Quote, QuoteInput};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/quotes", get(list).post(create))
        .route("/api/quotes/random", get(random))
        .route("/api/quotes/next", get(next))
        .route("/api/quotes/:id", get(show).put(update).delete(remove))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Quote>>> {
    Ok(Json(db::list_quotes(&state.pool).await?))
}

/// `null` when there are no quotes.
async fn random(State(state): State<AppState>) -> ApiResult<Json<Option<Quote>>> {
    Ok(Json(db::random_quote(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
struct NextQuery {
    after: Option<i64>,
}

async fn next(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<NextQuery>,
) -> ApiResult<Json<Option<Quote>>> {
    Ok(Json(db::next_quote(&state.pool, query.after).await?))
}

async fn show(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Quote>> {
    db::get_quote(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("quote {} not found", id)))
}

async fn create(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<QuoteInput>,
) -> ApiResult<(StatusCode, Json<Quote>)> {
    let quote = db::create_quote(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<QuoteInput>,
) -> ApiResult<Json<Quote>> {
    Ok(Json(db::update_quote(&state.pool, id, &input).await?))
}

async fn remove(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    db::delete_quote(&state.pool, id).await?;
    Ok(Json(json!({ "success": true })))
}
