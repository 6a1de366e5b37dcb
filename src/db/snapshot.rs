//! Row writers and table clears that run inside a caller's transaction.
//!
//! Restore and the two reset paths compose these so that every multi-table
//! change commits or rolls back as a unit. Inserts keep the original ids.

use crate::model::{Group, Item, Mailbox, Message, Note, Quote, Settings};
use anyhow::{bail, Result};
use sqlx::{Sqlite, Transaction};
use tracing::{info, instrument};

pub type Tx<'c> = Transaction<'c, Sqlite>;

/// Delete every row of `table` and reset its AUTOINCREMENT counter.
pub async fn clear_table(tx: &mut Tx<'_>, table: &str) -> Result<u64> {
    let deleted = sqlx::query(&format!("DELETE FROM {}", table))
        .execute(&mut **tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM sqlite_sequence WHERE name = ?")
        .bind(table)
        .execute(&mut **tx)
        .await?;
    Ok(deleted)
}

pub async fn count_rows(tx: &mut Tx<'_>, table: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(&mut **tx)
        .await?)
}

/// Clear `table` and confirm it is empty afterwards.
#[instrument(skip(tx))]
pub async fn clear_and_verify(tx: &mut Tx<'_>, table: &'static str) -> Result<i64> {
    let deleted = clear_table(tx, table).await?;
    let remaining = count_rows(tx, table).await?;
    info!(table, deleted, remaining, "cleared table");
    if remaining != 0 {
        bail!("table {} still has {} rows after clearing", table, remaining);
    }
    Ok(remaining)
}

pub async fn insert_settings(tx: &mut Tx<'_>, s: &Settings) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (id, title, theme, show_quotes, show_notes, show_mail, due_soon_days, header_image, notification_sound, updated_at)
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.title)
    .bind(&s.theme)
    .bind(s.show_quotes)
    .bind(s.show_notes)
    .bind(s.show_mail)
    .bind(s.due_soon_days)
    .bind(&s.header_image)
    .bind(&s.notification_sound)
    .bind(s.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_quote(tx: &mut Tx<'_>, q: &Quote) -> Result<()> {
    sqlx::query("INSERT INTO quotes (id, text, author, created_at) VALUES (?, ?, ?, ?)")
        .bind(q.id)
        .bind(&q.text)
        .bind(&q.author)
        .bind(q.created_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_note(tx: &mut Tx<'_>, n: &Note) -> Result<()> {
    sqlx::query(
        "INSERT INTO notes (id, title, content, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(n.id)
    .bind(&n.title)
    .bind(&n.content)
    .bind(n.created_at)
    .bind(n.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_group(tx: &mut Tx<'_>, g: &Group) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO groups (id, name, "order", icon, color, collapsed, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(g.id)
    .bind(&g.name)
    .bind(g.order)
    .bind(&g.icon)
    .bind(&g.color)
    .bind(g.collapsed)
    .bind(g.created_at)
    .bind(g.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_item(tx: &mut Tx<'_>, i: &Item) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO items (id, title, notes, status, "order", due_date, group_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(i.id)
    .bind(&i.title)
    .bind(&i.notes)
    .bind(i.status.as_str())
    .bind(i.order)
    .bind(i.due_date)
    .bind(i.group_id)
    .bind(i.created_at)
    .bind(i.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_mailbox(tx: &mut Tx<'_>, m: &Mailbox) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO mailboxes (id, name, host, port, username, password, folder, "order", color, icon, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(m.id)
    .bind(&m.name)
    .bind(&m.host)
    .bind(m.port)
    .bind(&m.username)
    .bind(&m.password)
    .bind(&m.folder)
    .bind(m.order)
    .bind(&m.color)
    .bind(&m.icon)
    .bind(m.created_at)
    .bind(m.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_message(tx: &mut Tx<'_>, m: &Message) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, mailbox_id, uid, message_id, subject, sender, date, seen, flagged, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(m.id)
    .bind(m.mailbox_id)
    .bind(m.uid)
    .bind(&m.message_id)
    .bind(&m.subject)
    .bind(&m.sender)
    .bind(m.date)
    .bind(m.seen)
    .bind(m.flagged)
    .bind(m.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
