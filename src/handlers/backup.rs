use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use super::{ApiJson, ApiResult, AppState};
use crate::auth;
use crate::backup::{self, Envelope, RestoreSummary};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/backup", get(export))
        .route("/api/restore", post(import))
}

/// The current data as a downloadable envelope. Nothing is written to disk.
async fn export(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let envelope = backup::collect(&state.pool, state.config.backup.include_email).await?;
    let disposition = format!(
        "attachment; filename=\"congeal-backup-{}.json\"",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    Ok(([(header::CONTENT_DISPOSITION, disposition)], Json(envelope)))
}

async fn import(
    State(state): State<AppState>,
    jar: CookieJar,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<(CookieJar, Json<RestoreSummary>)> {
    let envelope = Envelope::from_value(body)?;
    let summary = apply_restore(&state, &envelope).await?;
    Ok((jar.remove(auth::removal_cookie()), Json(summary)))
}

/// Restore and drop cache entries that may now describe other mailboxes.
pub(super) async fn apply_restore(state: &AppState, envelope: &Envelope) -> ApiResult<RestoreSummary> {
    let summary = backup::restore(&state.pool, envelope).await?;
    if let Err(err) = state.cache.clear_all().await {
        warn!(?err, "failed to clear mail cache after restore");
    }
    Ok(summary)
}
