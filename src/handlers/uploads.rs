use std::path::Path;

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::db;

const SOUND_FILE: &str = "notification.mp3";

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/upload", post(upload_sound))
}

/// An uploaded `file` part: original filename and bytes.
pub(super) struct Upload {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Lowercased extension of the original filename.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

pub(super) async fn read_file_field(mut multipart: Multipart) -> ApiResult<Upload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("uploaded file is empty".into()));
        }
        return Ok(Upload {
            filename,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::BadRequest("missing multipart field 'file'".into()))
}

/// Store `bytes` under the uploads directory and return its public URL.
pub(super) async fn store_upload(state: &AppState, name: &str, bytes: &[u8]) -> ApiResult<String> {
    let dir = state.config.uploads_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    tokio::fs::write(dir.join(name), bytes)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    info!(%name, size = bytes.len(), "upload stored");
    Ok(format!("/uploads/{}", name))
}

async fn upload_sound(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    let upload = read_file_field(multipart).await?;
    let url = store_upload(&state, SOUND_FILE, &upload.bytes).await?;
    let settings = db::set_notification_sound(&state.pool, &url).await?;
    Ok(Json(json!({ "success": true, "url": url, "settings": settings })))
}
