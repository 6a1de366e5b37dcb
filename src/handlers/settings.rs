use axum::extract::{Multipart, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::uploads::{read_file_field, store_upload};
use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::auth::{self, CurrentUser};
use crate::backup;
use crate::db;
use crate::model::{Settings, SettingsInput};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "svg"];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/settings", get(show).put(update))
        .route("/api/settings/header-image", post(header_image))
        .route("/api/settings/factory-reset", post(factory_reset))
        .route("/api/settings/reset-data", post(reset_data))
}

async fn show(State(state): State<AppState>) -> ApiResult<Json<Settings>> {
    Ok(Json(db::get_settings(&state.pool).await?))
}

async fn update(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<SettingsInput>,
) -> ApiResult<Json<Settings>> {
    Ok(Json(db::update_settings(&state.pool, &input).await?))
}

async fn header_image(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    let upload = read_file_field(multipart).await?;
    let ext = upload
        .extension()
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| ApiError::BadRequest("header image must be png, jpg, gif, webp or svg".into()))?;
    let url = store_upload(&state, &format!("header.{}", ext), &upload.bytes).await?;
    let settings = db::set_header_image(&state.pool, &url).await?;
    Ok(Json(json!({ "success": true, "url": url, "settings": settings })))
}

#[derive(Debug, Deserialize)]
struct FactoryResetBody {
    password: String,
}

async fn factory_reset(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    jar: CookieJar,
    ApiJson(body): ApiJson<FactoryResetBody>,
) -> ApiResult<(CookieJar, Json<Value>)> {
    backup::factory_reset_as(&state.pool, &user, &body.password).await?;
    if let Err(err) = state.cache.clear_all().await {
        warn!(?err, "failed to clear mail cache after factory reset");
    }
    info!(user_id = user.id, "factory reset via api");
    Ok((
        jar.remove(auth::removal_cookie()),
        Json(json!({ "success": true, "requiresSetup": true })),
    ))
}

async fn reset_data(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tables = backup::reset_data(&state.pool).await?;
    if let Err(err) = state.cache.clear_all().await {
        warn!(?err, "failed to clear mail cache after data reset");
    }
    Ok(Json(json!({ "success": true, "tables": tables })))
}
