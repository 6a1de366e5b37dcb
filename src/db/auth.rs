use super::Pool;
use crate::model::User;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

const USER_COLUMNS: &str = "id, username, password_hash, is_admin, reset_token, reset_token_expires_at, encryption_salt, created_at, updated_at";

#[instrument(skip_all)]
pub async fn count_users(pool: &Pool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn create_user(
    pool: &Pool,
    username: &str,
    password_hash: &str,
    encryption_salt: &str,
    is_admin: bool,
) -> Result<User> {
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO users (username, password_hash, is_admin, encryption_salt, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
        USER_COLUMNS
    );
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(username)
        .bind(password_hash)
        .bind(is_admin)
        .bind(encryption_salt)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn get_user(pool: &Pool, id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn find_user_by_username(pool: &Pool, username: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS);
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(username)
        .fetch_optional(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn list_admins(pool: &Pool) -> Result<Vec<User>> {
    let sql = format!("SELECT {} FROM users WHERE is_admin = 1 ORDER BY id", USER_COLUMNS);
    Ok(sqlx::query_as::<_, User>(&sql).fetch_all(pool).await?)
}

#[instrument(skip_all)]
pub async fn set_reset_token(
    pool: &Pool,
    user_id: i64,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE users SET reset_token = ?, reset_token_expires_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(token)
    .bind(expires_at)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// The user owning `token`, if the token has not expired at `now`.
#[instrument(skip_all)]
pub async fn find_user_by_reset_token(
    pool: &Pool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE reset_token = ?", USER_COLUMNS);
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(user.filter(|u| u.reset_token_expires_at.map(|e| e > now).unwrap_or(false)))
}

/// Replace the password, clear any reset token and drop the user's sessions.
#[instrument(skip_all)]
pub async fn update_password(
    pool: &Pool,
    user_id: i64,
    password_hash: &str,
    encryption_salt: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE users SET password_hash = ?, encryption_salt = ?, reset_token = NULL, reset_token_expires_at = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(password_hash)
    .bind(encryption_salt)
    .bind(Utc::now())
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_session(
    pool: &Pool,
    user_id: i64,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (token_hash, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(token_hash)
    .bind(user_id)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve a session token hash to its user. Expired sessions are removed.
#[instrument(skip_all)]
pub async fn find_session_user(
    pool: &Pool,
    token_hash: &str,
    now: DateTime<Utc>,
) -> Result<Option<User>> {
    let row: Option<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT user_id, expires_at FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(pool)
            .await?;
    let Some((user_id, expires_at)) = row else {
        return Ok(None);
    };
    if expires_at <= now {
        delete_session(pool, token_hash).await?;
        return Ok(None);
    }
    get_user(pool, user_id).await
}

#[instrument(skip_all)]
pub async fn delete_session(pool: &Pool, token_hash: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
        .bind(token_hash)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Rate-limit counters
// ---------------------------------------------------------------------------

/// Count one hit for `key` in a fixed window of `window_secs` and return the
/// count so far in the current window. The upsert is a single statement, so
/// concurrent callers (even in other processes) never lose a hit. Counters
/// whose window has ended are dropped first, whatever their key.
#[instrument(skip_all)]
pub async fn hit_rate_limit(pool: &Pool, key: &str, now_secs: i64, window_secs: i64) -> Result<i64> {
    let pruned = sqlx::query("DELETE FROM rate_limits WHERE ?1 - window_start >= ?2")
        .bind(now_secs)
        .bind(window_secs)
        .execute(pool)
        .await?
        .rows_affected();
    if pruned > 0 {
        debug!(pruned, "expired rate-limit counters removed");
    }
    let count: i64 = sqlx::query_scalar(
        r#"INSERT INTO rate_limits (key, count, window_start) VALUES (?1, 1, ?2)
           ON CONFLICT(key) DO UPDATE SET
             count = CASE WHEN ?2 - rate_limits.window_start >= ?3 THEN 1 ELSE rate_limits.count + 1 END,
             window_start = CASE WHEN ?2 - rate_limits.window_start >= ?3 THEN ?2 ELSE rate_limits.window_start END
           RETURNING count"#,
    )
    .bind(key)
    .bind(now_secs)
    .bind(window_secs)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_pool, run_migrations};
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn sessions_expire() {
        let pool = setup_pool().await;
        let user = create_user(&pool, "ada", "hash", "salt", true).await.unwrap();
        let now = Utc::now();
        create_session(&pool, user.id, "live", now + Duration::hours(1))
            .await
            .unwrap();
        create_session(&pool, user.id, "stale", now - Duration::hours(1))
            .await
            .unwrap();

        let found = find_session_user(&pool, "live", now).await.unwrap();
        assert_eq!(found.map(|u| u.username), Some("ada".to_string()));
        assert!(find_session_user(&pool, "stale", now).await.unwrap().is_none());
        assert!(find_session_user(&pool, "missing", now).await.unwrap().is_none());

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn password_update_clears_token_and_sessions() {
        let pool = setup_pool().await;
        let user = create_user(&pool, "ada", "hash", "salt", true).await.unwrap();
        let now = Utc::now();
        set_reset_token(&pool, user.id, "tok", now + Duration::hours(1))
            .await
            .unwrap();
        create_session(&pool, user.id, "s1", now + Duration::hours(1))
            .await
            .unwrap();

        assert!(find_user_by_reset_token(&pool, "tok", now + Duration::hours(2))
            .await
            .unwrap()
            .is_none());
        let u = find_user_by_reset_token(&pool, "tok", now).await.unwrap().unwrap();
        update_password(&pool, u.id, "hash2", "salt2").await.unwrap();

        let u = get_user(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(u.password_hash, "hash2");
        assert!(u.reset_token.is_none());
        assert!(find_session_user(&pool, "s1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_window_resets() {
        let pool = setup_pool().await;
        assert_eq!(hit_rate_limit(&pool, "k", 100, 60).await.unwrap(), 1);
        assert_eq!(hit_rate_limit(&pool, "k", 110, 60).await.unwrap(), 2);
        assert_eq!(hit_rate_limit(&pool, "other", 110, 60).await.unwrap(), 1);
        assert_eq!(hit_rate_limit(&pool, "k", 160, 60).await.unwrap(), 1);
        assert_eq!(hit_rate_limit(&pool, "k", 161, 60).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_counters_are_pruned() {
        let pool = setup_pool().await;
        for n in 0..5 {
            hit_rate_limit(&pool, &format!("client-{}", n), 100, 60).await.unwrap();
        }
        hit_rate_limit(&pool, "late", 130, 60).await.unwrap();

        hit_rate_limit(&pool, "fresh", 170, 60).await.unwrap();
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM rate_limits ORDER BY key")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(keys, vec!["fresh".to_string(), "late".to_string()]);
        assert_eq!(hit_rate_limit(&pool, "late", 171, 60).await.unwrap(), 2);
    }
}
