use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::auth::{self, AUTH_COOKIE};
use crate::db;
use crate::mail::compose;

const MIN_PASSWORD_LEN: usize = 8;
const RESET_TOKEN_TTL_MINUTES: i64 = 60;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/setup", get(setup_status).post(setup))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/verify", get(verify))
        .route("/api/auth/reset/request", post(request_reset))
        .route("/api/auth/reset", post(reset_password))
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

fn check_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

async fn setup_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let users = db::count_users(&state.pool).await?;
    Ok(Json(json!({ "needsSetup": users == 0 })))
}

/// First run: create the admin account and default settings, then log in.
async fn setup(
    State(state): State<AppState>,
    jar: CookieJar,
    ApiJson(body): ApiJson<Credentials>,
) -> ApiResult<(CookieJar, Json<Value>)> {
    if db::count_users(&state.pool).await? > 0 {
        return Err(ApiError::BadRequest("setup has already been completed".into()));
    }
    let username = body.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username must be non-empty".into()));
    }
    check_password(&body.password)?;

    let (hash, salt) = auth::hash_password(&body.password)?;
    let user = db::create_user(&state.pool, username, &hash, &salt, true).await?;
    db::get_settings(&state.pool).await?;
    info!(user_id = user.id, "initial admin created");

    let token = auth::start_session(&state.pool, user.id, state.config.app.session_ttl_hours).await?;
    Ok((
        jar.add(auth::session_cookie(token)),
        Json(json!({ "success": true, "user": user })),
    ))
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    ApiJson(body): ApiJson<Credentials>,
) -> ApiResult<(CookieJar, Json<Value>)> {
    let user = db::find_user_by_username(&state.pool, body.username.trim()).await?;
    let Some(user) = user.filter(|u| auth::verify_password(&u.password_hash, &body.password)) else {
        warn!(username = %body.username, "failed login");
        return Err(ApiError::Unauthorized("invalid username or password".into()));
    };
    let token = auth::start_session(&state.pool, user.id, state.config.app.session_ttl_hours).await?;
    info!(user_id = user.id, "login");
    Ok((
        jar.add(auth::session_cookie(token)),
        Json(json!({ "success": true, "user": user })),
    ))
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> ApiResult<(CookieJar, Json<Value>)> {
    if let Some(cookie) = jar.get(AUTH_COOKIE) {
        auth::end_session(&state.pool, cookie.value()).await?;
    }
    Ok((jar.remove(auth::removal_cookie()), Json(json!({ "success": true }))))
}

async fn verify(State(state): State<AppState>, jar: CookieJar) -> ApiResult<Json<Value>> {
    let user = match jar.get(AUTH_COOKIE) {
        Some(cookie) => auth::session_user(&state.pool, cookie.value()).await?,
        None => None,
    };
    Ok(Json(match user {
        Some(user) => json!({ "authenticated": true, "user": user }),
        None => json!({ "authenticated": false }),
    }))
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    username: String,
}

/// Issue a one-hour reset token. The response is the same whether or not the
/// user exists.
async fn request_reset(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetRequest>,
) -> ApiResult<Json<Value>> {
    let ok = Json(json!({ "success": true }));
    let Some(user) = db::find_user_by_username(&state.pool, body.username.trim()).await? else {
        return Ok(ok);
    };
    let token = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES);
    db::set_reset_token(&state.pool, user.id, &token, expires_at).await?;

    match &state.config.smtp {
        Some(smtp) => {
            let body = format!(
                "A password reset was requested for {}.\n\nReset token: {}\n\nThe token expires at {}.",
                user.username,
                token,
                expires_at.to_rfc3339()
            );
            let sent = match compose::build_notice(&smtp.from, &user.username, "Congeal password reset", &body) {
                Ok(message) => compose::send_via_relay(smtp, message).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                warn!(?err, user_id = user.id, %token, "could not mail reset token");
            }
        }
        None => info!(user_id = user.id, %token, %expires_at, "password reset token issued"),
    }
    Ok(ok)
}

#[derive(Debug, Deserialize)]
struct ResetBody {
    token: String,
    password: String,
}

async fn reset_password(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetBody>,
) -> ApiResult<Json<Value>> {
    check_password(&body.password)?;
    let user = db::find_user_by_reset_token(&state.pool, body.token.trim(), Utc::now())
        .await?
        .ok_or_else(|| ApiError::BadRequest("invalid or expired reset token".into()))?;
    let (hash, salt) = auth::hash_password(&body.password)?;
    db::update_password(&state.pool, user.id, &hash, &salt).await?;
    info!(user_id = user.id, "password reset");
    Ok(Json(json!({ "success": true })))
}
