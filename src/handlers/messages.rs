use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::mailboxes::load_mailbox;
use super::{ApiError, ApiJson, ApiQuery, ApiResult, AppState};
use crate::db;
use crate::mail::{self, compose, CacheStatus, MailAccount, MailError, RemoteMessage};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/messages", get(list))
        .route("/api/messages/mark-seen", post(mark_seen))
        .route("/api/messages/reply", post(reply))
        .route("/api/messages/cache", get(cache_status).delete(invalidate_cache))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    mailbox_id: i64,
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    mailbox_id: i64,
    cached: bool,
    messages: Vec<RemoteMessage>,
}

/// Serve from the cache while it is fresh, otherwise fetch from the server
/// and refresh both the stored headers and the cache.
async fn list(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<MessageList>> {
    let mailbox = load_mailbox(&state, query.mailbox_id).await?;
    if !query.refresh {
        if let Some(messages) = state.cache.read_fresh(mailbox.id).await? {
            return Ok(Json(MessageList {
                mailbox_id: mailbox.id,
                cached: true,
                messages,
            }));
        }
    }

    let account = MailAccount::from(&mailbox);
    let messages =
        mail::fetch_recent(state.mail.as_ref(), &account, state.config.mail.fetch_limit).await?;
    db::replace_messages(&state.pool, mailbox.id, &messages).await?;
    if let Err(err) = state.cache.write(mailbox.id, &messages).await {
        warn!(?err, "failed to write mail cache");
    }
    info!(mailbox_id = mailbox.id, count = messages.len(), "messages fetched");
    Ok(Json(MessageList {
        mailbox_id: mailbox.id,
        cached: false,
        messages,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkSeenBody {
    mailbox_id: i64,
    uid: u32,
}

async fn mark_seen(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<MarkSeenBody>,
) -> ApiResult<Json<Value>> {
    let mailbox = load_mailbox(&state, body.mailbox_id).await?;
    mail::mark_seen(state.mail.as_ref(), &MailAccount::from(&mailbox), body.uid).await?;
    db::mark_message_seen(&state.pool, mailbox.id, body.uid).await?;
    if let Err(err) = state.cache.mark_seen(mailbox.id, body.uid).await {
        warn!(?err, mailbox_id = mailbox.id, "failed to update mail cache");
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyBody {
    mailbox_id: i64,
    uid: u32,
    body: String,
}

/// Relay the reply when SMTP is configured and always file a copy in the
/// sent folder.
async fn reply(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ReplyBody>,
) -> ApiResult<Json<Value>> {
    if req.body.trim().is_empty() {
        return Err(ApiError::BadRequest("reply body must be non-empty".into()));
    }
    let mailbox = load_mailbox(&state, req.mailbox_id).await?;
    let original = db::get_message(&state.pool, mailbox.id, req.uid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("message {} not found", req.uid)))?;

    let message = compose::build_reply(&mailbox.username, &original, &req.body).map_err(|e| match e {
        MailError::Compose(msg) => ApiError::BadRequest(msg),
        other => other.into(),
    })?;
    let raw = message.formatted();

    let relayed = match &state.config.smtp {
        Some(smtp) => {
            compose::send_via_relay(smtp, message).await?;
            true
        }
        None => false,
    };
    let account = MailAccount::from(&mailbox);
    mail::append(state.mail.as_ref(), &account, &state.config.mail.sent_folder, &raw).await?;
    info!(mailbox_id = mailbox.id, uid = req.uid, relayed, "reply stored");
    Ok(Json(json!({ "success": true, "relayed": relayed })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheQuery {
    mailbox_id: i64,
}

async fn cache_status(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CacheQuery>,
) -> ApiResult<Json<CacheStatus>> {
    Ok(Json(state.cache.status(query.mailbox_id).await?))
}

async fn invalidate_cache(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CacheQuery>,
) -> ApiResult<Json<Value>> {
    let removed = state.cache.invalidate(query.mailbox_id).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}
