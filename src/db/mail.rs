use super::model::{required, Invalid, NotFound};
use super::Pool;
use crate::mail::RemoteMessage;
use crate::model::{Mailbox, MailboxInput, Message};
use anyhow::Result;
use chrono::Utc;
use tracing::instrument;

const MAILBOX_COLUMNS: &str = r#"id, name, host, port, username, password, folder, "order", color, icon, created_at, updated_at"#;
const MESSAGE_COLUMNS: &str =
    "id, mailbox_id, uid, message_id, subject, sender, date, seen, flagged, created_at";

fn valid_port(port: i64) -> Result<i64> {
    if (1..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(Invalid(format!("port {} out of range", port)).into())
    }
}

#[instrument(skip_all)]
pub async fn list_mailboxes(pool: &Pool) -> Result<Vec<Mailbox>> {
    let sql = format!(r#"SELECT {} FROM mailboxes ORDER BY "order", id"#, MAILBOX_COLUMNS);
    Ok(sqlx::query_as::<_, Mailbox>(&sql).fetch_all(pool).await?)
}

#[instrument(skip_all)]
pub async fn get_mailbox(pool: &Pool, id: i64) -> Result<Option<Mailbox>> {
    let sql = format!("SELECT {} FROM mailboxes WHERE id = ?", MAILBOX_COLUMNS);
    Ok(sqlx::query_as::<_, Mailbox>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn create_mailbox(pool: &Pool, input: &MailboxInput) -> Result<Mailbox> {
    let name = required(input.name.as_ref(), "name")?;
    let host = required(input.host.as_ref(), "host")?;
    let username = required(input.username.as_ref(), "username")?;
    let password = input
        .password
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Invalid("password must be non-empty".into()))?;
    let port = valid_port(input.port.unwrap_or(993))?;
    let folder = input
        .folder
        .clone()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| "INBOX".to_string());
    let order = match input.order {
        Some(order) => order,
        None => {
            sqlx::query_scalar(r#"SELECT COALESCE(MAX("order"), -1) + 1 FROM mailboxes"#)
                .fetch_one(pool)
                .await?
        }
    };
    let now = Utc::now();
    let sql = format!(
        r#"INSERT INTO mailboxes (name, host, port, username, password, folder, "order", color, icon, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}"#,
        MAILBOX_COLUMNS
    );
    Ok(sqlx::query_as::<_, Mailbox>(&sql)
        .bind(name)
        .bind(host)
        .bind(port)
        .bind(username)
        .bind(password)
        .bind(folder)
        .bind(order)
        .bind(input.color.clone().flatten())
        .bind(input.icon.clone().flatten())
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?)
}

/// Update a mailbox. An absent or empty password keeps the stored one.
#[instrument(skip_all)]
pub async fn update_mailbox(pool: &Pool, id: i64, input: &MailboxInput) -> Result<Mailbox> {
    let mut mb = get_mailbox(pool, id)
        .await?
        .ok_or(NotFound::new("mailbox", id))?;
    if input.name.is_some() {
        mb.name = required(input.name.as_ref(), "name")?;
    }
    if input.host.is_some() {
        mb.host = required(input.host.as_ref(), "host")?;
    }
    if input.username.is_some() {
        mb.username = required(input.username.as_ref(), "username")?;
    }
    if let Some(password) = input.password.as_ref().filter(|p| !p.is_empty()) {
        mb.password = password.clone();
    }
    if let Some(port) = input.port {
        mb.port = valid_port(port)?;
    }
    if input.folder.is_some() {
        mb.folder = required(input.folder.as_ref(), "folder")?;
    }
    if let Some(order) = input.order {
        mb.order = order;
    }
    if let Some(color) = &input.color {
        mb.color = color.clone();
    }
    if let Some(icon) = &input.icon {
        mb.icon = icon.clone();
    }
    mb.updated_at = Utc::now();
    sqlx::query(
        r#"UPDATE mailboxes SET name = ?, host = ?, port = ?, username = ?, password = ?, folder = ?, "order" = ?, color = ?, icon = ?, updated_at = ? WHERE id = ?"#,
    )
    .bind(&mb.name)
    .bind(&mb.host)
    .bind(mb.port)
    .bind(&mb.username)
    .bind(&mb.password)
    .bind(&mb.folder)
    .bind(mb.order)
    .bind(&mb.color)
    .bind(&mb.icon)
    .bind(mb.updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(mb)
}

/// Messages cascade with their mailbox.
#[instrument(skip_all)]
pub async fn delete_mailbox(pool: &Pool, id: i64) -> Result<()> {
    let res = sqlx::query("DELETE FROM mailboxes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(NotFound::new("mailbox", id).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_messages(pool: &Pool, mailbox_id: i64) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE mailbox_id = ? ORDER BY uid DESC",
        MESSAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, Message>(&sql)
        .bind(mailbox_id)
        .fetch_all(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn list_all_messages(pool: &Pool) -> Result<Vec<Message>> {
    let sql = format!("SELECT {} FROM messages ORDER BY id", MESSAGE_COLUMNS);
    Ok(sqlx::query_as::<_, Message>(&sql).fetch_all(pool).await?)
}

#[instrument(skip_all)]
pub async fn get_message(pool: &Pool, mailbox_id: i64, uid: u32) -> Result<Option<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE mailbox_id = ? AND uid = ?",
        MESSAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, Message>(&sql)
        .bind(mailbox_id)
        .bind(i64::from(uid))
        .fetch_optional(pool)
        .await?)
}

/// Make the stored headers for `mailbox_id` match a fresh remote listing:
/// upsert every fetched message and drop rows whose UID is gone.
#[instrument(skip_all, fields(mailbox_id = mailbox_id, count = fetched.len()))]
pub async fn replace_messages(
    pool: &Pool,
    mailbox_id: i64,
    fetched: &[RemoteMessage],
) -> Result<Vec<Message>> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for m in fetched {
        sqlx::query(
            r#"INSERT INTO messages (mailbox_id, uid, message_id, subject, sender, date, seen, flagged, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(mailbox_id, uid) DO UPDATE SET
                 message_id = excluded.message_id,
                 subject = excluded.subject,
                 sender = excluded.sender,
                 date = excluded.date,
                 seen = excluded.seen,
                 flagged = excluded.flagged"#,
        )
        .bind(mailbox_id)
        .bind(i64::from(m.uid))
        .bind(&m.message_id)
        .bind(&m.subject)
        .bind(&m.sender)
        .bind(m.date)
        .bind(m.seen)
        .bind(m.flagged)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    let keep: Vec<i64> = fetched.iter().map(|m| i64::from(m.uid)).collect();
    let existing: Vec<i64> = sqlx::query_scalar("SELECT uid FROM messages WHERE mailbox_id = ?")
        .bind(mailbox_id)
        .fetch_all(&mut *tx)
        .await?;
    for uid in existing.into_iter().filter(|uid| !keep.contains(uid)) {
        sqlx::query("DELETE FROM messages WHERE mailbox_id = ? AND uid = ?")
            .bind(mailbox_id)
            .bind(uid)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    list_messages(pool, mailbox_id).await
}

/// Set the seen flag on a stored message. Returns whether a row matched.
#[instrument(skip_all)]
pub async fn mark_message_seen(pool: &Pool, mailbox_id: i64, uid: u32) -> Result<bool> {
    let res = sqlx::query("UPDATE messages SET seen = 1 WHERE mailbox_id = ? AND uid = ?")
        .bind(mailbox_id)
        .bind(i64::from(uid))
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
