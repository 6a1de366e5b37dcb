//! Fixed-window request counters kept in the database, so limits hold across
//! restarts and across processes sharing the same file.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tracing::{debug, warn};

use crate::db::{self, Pool};
use crate::handlers::{ApiError, AppState};

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record one hit for `key` and return the hit count in the current window.
    async fn hit(&self, key: &str, window: Duration) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteRateLimitStore {
    pool: Pool,
}

impl SqliteRateLimitStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Utc::now().timestamp();
        let count = db::hit_rate_limit(&self.pool, key, now, window.as_secs() as i64).await?;
        Ok(count.max(0) as u64)
    }
}

/// First `X-Forwarded-For` entry, then the peer address, else `unknown`.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// The first two path segments, e.g. `/api/auth` for `/api/auth/login`.
pub fn route_prefix(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(2).collect();
    format!("/{}", segments.join("/"))
}

pub async fn limit_requests(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = format!(
        "{}|{}",
        client_key(req.headers(), peer),
        route_prefix(req.uri().path())
    );
    let limits = &state.config.rate_limit;
    match state
        .rate_limits
        .hit(&key, Duration::from_secs(limits.window_seconds))
        .await
    {
        Ok(count) if count > limits.max_requests => {
            debug!(%key, count, "rate limit exceeded");
            return Err(ApiError::TooManyRequests);
        }
        Ok(_) => {}
        // Counting is best effort; a store failure must not lock users out.
        Err(err) => warn!(?err, %key, "rate limit store failed"),
    }
    Ok(next.run(req).await)
}
