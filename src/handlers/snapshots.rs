use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde_json::{json, Value};

use super::backup::apply_restore;
use super::{ApiPath, ApiResult, AppState};
use crate::auth;
use crate::backup::{self, RestoreSummary, SnapshotInfo};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/snapshots", get(list).post(create))
        .route("/api/snapshots/:name", get(download).delete(remove))
        .route("/api/snapshots/:name/restore", post(restore))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let snapshots = state.snapshots.list().await?;
    Ok(Json(json!({
        "snapshots": snapshots,
        "max": state.config.backup.max_snapshots,
    })))
}

async fn create(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<SnapshotInfo>)> {
    let envelope = backup::collect(&state.pool, state.config.backup.include_email).await?;
    let info = state.snapshots.create(&envelope).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn download(
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
) -> ApiResult<impl IntoResponse> {
    let raw = state.snapshots.read_raw(&name).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        raw,
    ))
}

async fn remove(State(state): State<AppState>, ApiPath(name): ApiPath<String>) -> ApiResult<Json<Value>> {
    state.snapshots.delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

async fn restore(
    State(state): State<AppState>,
    jar: CookieJar,
    ApiPath(name): ApiPath<String>,
) -> ApiResult<(CookieJar, Json<RestoreSummary>)> {
    let envelope = state.snapshots.read(&name).await?;
    let summary = apply_restore(&state, &envelope).await?;
    Ok((jar.remove(auth::removal_cookie()), Json(summary)))
}
