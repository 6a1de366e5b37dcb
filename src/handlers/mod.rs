//! HTTP API: shared state, JSON error mapping and router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use thiserror::Error;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::backup::{BackupError, SnapshotStore};
use crate::config::Config;
use crate::db::{Invalid, NotFound, Pool};
use crate::mail::{MailCache, MailConnector, MailError};
use crate::rate_limit::{RateLimitStore, SqliteRateLimitStore};

mod auth;
mod backup;
mod groups;
mod items;
mod mailboxes;
mod messages;
mod notes;
mod quotes;
mod settings;
mod snapshots;
mod uploads;

/// Uploads and restore bodies can be large.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub mail: Arc<dyn MailConnector>,
    pub cache: MailCache,
    pub snapshots: SnapshotStore,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl AppState {
    pub fn new(pool: Pool, config: Config, mail: Arc<dyn MailConnector>) -> Self {
        let cache = MailCache::new(
            config.cache_dir(),
            Duration::from_secs(config.mail.cache_ttl_seconds),
        );
        let snapshots = SnapshotStore::new(config.snapshots_dir(), config.backup.max_snapshots);
        let rate_limits = Arc::new(SqliteRateLimitStore::new(pool.clone()));
        Self {
            pool,
            config: Arc::new(config),
            mail,
            cache,
            snapshots,
            rate_limits,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("too many requests, try again later")]
    TooManyRequests,
    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(nf) = err.downcast_ref::<NotFound>() {
            return ApiError::NotFound(nf.to_string());
        }
        if let Some(invalid) = err.downcast_ref::<Invalid>() {
            return ApiError::BadRequest(invalid.to_string());
        }
        if let Some(backup) = err.downcast_ref::<BackupError>() {
            return match backup {
                BackupError::InvalidEnvelope(_)
                | BackupError::LimitReached(_)
                | BackupError::InvalidName(_) => ApiError::BadRequest(backup.to_string()),
                BackupError::Missing(_) => ApiError::NotFound(backup.to_string()),
                BackupError::WrongPassword => ApiError::Unauthorized(backup.to_string()),
            };
        }
        ApiError::Internal(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<MailError> for ApiError {
    fn from(err: MailError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(err) => {
                error!(?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// `axum::Json` with rejections rendered as `{error}` 400s.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let public = auth::routes().route_layer(from_fn_with_state(
        state.clone(),
        crate::rate_limit::limit_requests,
    ));

    let protected = Router::new()
        .merge(groups::routes())
        .merge(items::routes())
        .merge(mailboxes::routes())
        .merge(messages::routes())
        .merge(notes::routes())
        .merge(quotes::routes())
        .merge(settings::routes())
        .merge(snapshots::routes())
        .merge(uploads::routes())
        .merge(backup::routes())
        .route_layer(from_fn_with_state(
            state.clone(),
            crate::auth::require_session,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback_service(ServeDir::new(state.config.public_dir()))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
