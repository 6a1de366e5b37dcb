use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ApiError, ApiJson, ApiPath, ApiResult, AppState};
use crate::db::{self, Reorderable};
use crate::mail::{self, MailAccount};
use crate::model::{Mailbox, MailboxInput, MailboxSummary, ReorderEntry};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/mailboxes", get(list).post(create))
        .route("/api/mailboxes/reorder", put(reorder))
        .route("/api/mailboxes/test", post(test))
        .route("/api/mailboxes/:id", get(show).put(update).delete(remove))
}

pub(super) async fn load_mailbox(state: &AppState, id: i64) -> ApiResult<Mailbox> {
    db::get_mailbox(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("mailbox {} not found", id)))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<MailboxSummary>>> {
    let mailboxes = db::list_mailboxes(&state.pool).await?;
    Ok(Json(mailboxes.into_iter().map(MailboxSummary::from).collect()))
}

async fn show(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<MailboxSummary>> {
    Ok(Json(load_mailbox(&state, id).await?.into()))
}

async fn create(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<MailboxInput>,
) -> ApiResult<(StatusCode, Json<MailboxSummary>)> {
    let mailbox = db::create_mailbox(&state.pool, &input).await?;
    info!(mailbox_id = mailbox.id, "mailbox created");
    Ok((StatusCode::CREATED, Json(mailbox.into())))
}

async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<MailboxInput>,
) -> ApiResult<Json<MailboxSummary>> {
    let mailbox = db::update_mailbox(&state.pool, id, &input).await?;
    state.cache.invalidate(id).await?;
    Ok(Json(mailbox.into()))
}

async fn remove(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    db::delete_mailbox(&state.pool, id).await?;
    state.cache.invalidate(id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn reorder(
    State(state): State<AppState>,
    ApiJson(entries): ApiJson<Vec<ReorderEntry>>,
) -> ApiResult<Json<Value>> {
    db::reorder(&state.pool, Reorderable::Mailboxes, &entries).await?;
    Ok(Json(json!({ "success": true, "updated": entries.len() })))
}

/// Either a stored mailbox (`mailboxId`, with fields overriding it) or a
/// complete set of unsaved credentials.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestBody {
    mailbox_id: Option<i64>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    folder: Option<String>,
}

async fn test(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TestBody>,
) -> ApiResult<Json<Value>> {
    let mut account = match body.mailbox_id {
        Some(id) => MailAccount::from(&load_mailbox(&state, id).await?),
        None => MailAccount {
            host: String::new(),
            port: 993,
            username: String::new(),
            password: String::new(),
            folder: "INBOX".into(),
        },
    };
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    if let Some(host) = non_empty(body.host) {
        account.host = host;
    }
    if let Some(port) = body.port {
        account.port = port;
    }
    if let Some(username) = non_empty(body.username) {
        account.username = username;
    }
    if let Some(password) = non_empty(body.password) {
        account.password = password;
    }
    if let Some(folder) = non_empty(body.folder) {
        account.folder = folder;
    }
    if account.host.is_empty() || account.username.is_empty() || account.password.is_empty() {
        return Err(ApiError::BadRequest(
            "host, username and password are required".into(),
        ));
    }

    match mail::test_connection(state.mail.as_ref(), &account).await {
        Ok(()) => Ok(Json(json!({ "success": true }))),
        Err(err) => {
            warn!(?err, ?account, "mailbox test failed");
            Ok(Json(json!({ "success": false, "error": err.to_string() })))
        }
    }
}
