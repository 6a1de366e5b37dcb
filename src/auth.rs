//! Password hashing and cookie sessions.
//!
//! The `auth-token` cookie carries 32 random bytes. Only the SHA-256 of that
//! value is stored, so a leaked database does not yield usable cookies.

use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::handlers::{ApiError, AppState};
use crate::model::User;

pub const AUTH_COOKIE: &str = "auth-token";

/// The authenticated user, inserted into request extensions by
/// [`require_session`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Hash `password` with a fresh salt. Returns `(phc_hash, salt)`.
pub fn hash_password(password: &str) -> Result<(String, String)> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| anyhow!("failed to encode salt: {}", e))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash password: {}", e))?
        .to_string();
    Ok((hash, salt.as_str().to_string()))
}

pub fn verify_password(password_hash: &str, password: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn new_session_token() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

pub fn hash_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Create a session row for `user_id` and return the cookie value.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn start_session(pool: &Pool, user_id: i64, ttl_hours: u64) -> Result<String> {
    let token = new_session_token();
    let expires_at = Utc::now() + Duration::hours(ttl_hours as i64);
    db::create_session(pool, user_id, &hash_token(&token), expires_at).await?;
    Ok(token)
}

pub async fn session_user(pool: &Pool, token: &str) -> Result<Option<User>> {
    db::find_session_user(pool, &hash_token(token), Utc::now()).await
}

pub async fn end_session(pool: &Pool, token: &str) -> Result<()> {
    db::delete_session(pool, &hash_token(token)).await
}

pub fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

pub fn removal_cookie() -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, "")).path("/").build()
}

/// Reject requests without a live session with 401.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = jar.get(AUTH_COOKIE).map(|c| c.value().to_string()) else {
        return Err(ApiError::Unauthorized("not authenticated".into()));
    };
    match session_user(&state.pool, &token).await? {
        Some(user) => {
            debug!(user_id = user.id, "session ok");
            req.extensions_mut().insert(CurrentUser(user));
            Ok(next.run(req).await)
        }
        None => Err(ApiError::Unauthorized("session expired or invalid".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_pool, run_migrations};

    #[test]
    fn hash_and_verify() {
        let (hash, salt) = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(hash.contains(&salt));
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("garbage", "hunter2"));

        let (other, other_salt) = hash_password("hunter2").unwrap();
        assert_ne!(salt, other_salt);
        assert_ne!(hash, other);
    }

    #[test]
    fn tokens_are_random_and_hashed() {
        let a = new_session_token();
        let b = new_session_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        let h = hash_token(&a);
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_token(&a));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let (hash, salt) = hash_password("pw").unwrap();
        let user = db::create_user(&pool, "admin", &hash, &salt, true).await.unwrap();

        let token = start_session(&pool, user.id, 1).await.unwrap();
        let found = session_user(&pool, &token).await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(session_user(&pool, "forged").await.unwrap().is_none());

        end_session(&pool, &token).await.unwrap();
        assert!(session_user(&pool, &token).await.unwrap().is_none());
    }

    #[test]
    fn cookie_attributes() {
        let c = session_cookie("abc".into());
        assert_eq!(c.name(), AUTH_COOKIE);
        assert_eq!(c.http_only(), Some(true));
        assert_eq!(c.same_site(), Some(SameSite::Lax));
        assert_eq!(c.path(), Some("/"));
    }
}
