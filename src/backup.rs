//! Snapshots, restore and the two reset paths.
//!
//! A snapshot is a JSON envelope:
//! `{version, schema: {includesEmail}, data: {settings, groups, items, quotes, notes, mailboxes?, messages?}}`.
//! Restore and both resets run in a single transaction each.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::auth::verify_password;
use crate::db::snapshot::{self, clear_and_verify, clear_table};
use crate::db::{self, Pool, TableReport};
use crate::model::{Group, Item, Mailbox, Message, Note, Quote, Settings, User};

pub const BACKUP_VERSION: &str = "1.0";

static SNAPSHOT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^snapshot-[0-9TZ-]+\.json$").expect("valid snapshot name regex"));

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup: {0}")]
    InvalidEnvelope(String),
    #[error("snapshot limit of {0} reached, delete a snapshot first")]
    LimitReached(usize),
    #[error("invalid snapshot name: {0}")]
    InvalidName(String),
    #[error("snapshot {0} not found")]
    Missing(String),
    #[error("admin password is incorrect")]
    WrongPassword,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub includes_email: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Older exports nest the owning group in each item; it is ignored and
    /// only `groupId` is kept.
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub quotes: Vec<Quote>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailboxes: Option<Vec<Mailbox>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub version: String,
    pub schema: SchemaInfo,
    pub data: SnapshotData,
}

impl Envelope {
    /// Parse an uploaded or stored backup, rejecting anything without
    /// `version`, `schema` and `data`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| BackupError::InvalidEnvelope("expected a JSON object".into()))?;
        for key in ["version", "schema", "data"] {
            if obj.get(key).map(|v| v.is_null()).unwrap_or(true) {
                return Err(BackupError::InvalidEnvelope(format!("missing {}", key)).into());
            }
        }
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| BackupError::InvalidEnvelope(e.to_string()))?;
        if envelope.version != BACKUP_VERSION {
            warn!(version = %envelope.version, "restoring backup with unexpected version");
        }
        Ok(envelope)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| BackupError::InvalidEnvelope(e.to_string()))?;
        Self::from_value(value)
    }
}

/// Read every exported table. Mail tables are included only on request.
#[instrument(skip_all, fields(include_email))]
pub async fn collect(pool: &Pool, include_email: bool) -> Result<Envelope> {
    let (settings, groups, items, quotes, notes) = futures::try_join!(
        db::get_settings(pool),
        db::list_groups(pool),
        db::list_items(pool, None),
        db::list_quotes(pool),
        db::list_notes(pool),
    )?;
    let (mailboxes, messages) = if include_email {
        let (mailboxes, messages) =
            futures::try_join!(db::list_mailboxes(pool), db::list_all_messages(pool))?;
        (Some(mailboxes), Some(messages))
    } else {
        (None, None)
    };
    Ok(Envelope {
        version: BACKUP_VERSION.to_string(),
        schema: SchemaInfo {
            includes_email: include_email,
        },
        data: SnapshotData {
            settings: Some(settings),
            groups,
            items,
            quotes,
            notes,
            mailboxes,
            messages,
        },
    })
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub groups: usize,
    pub items: usize,
    pub quotes: usize,
    pub notes: usize,
    pub mailboxes: usize,
    pub messages: usize,
    /// Users are not part of a backup, so the first-run setup must be repeated.
    pub requires_setup: bool,
}

/// Replace all application data with the envelope's content.
#[instrument(skip_all, fields(include_email = envelope.schema.includes_email))]
pub async fn restore(pool: &Pool, envelope: &Envelope) -> Result<RestoreSummary> {
    let data = &envelope.data;
    let with_email = envelope.schema.includes_email;
    let mut tx = pool.begin().await?;

    for table in [
        "messages", "mailboxes", "notes", "quotes", "items", "groups", "settings", "users",
    ] {
        let deleted = clear_table(&mut tx, table).await?;
        info!(table, deleted, "restore: cleared");
    }

    if let Some(settings) = &data.settings {
        snapshot::insert_settings(&mut tx, settings).await?;
    }
    for q in &data.quotes {
        snapshot::insert_quote(&mut tx, q)
            .await
            .with_context(|| format!("restoring quote {}", q.id))?;
    }
    for n in &data.notes {
        snapshot::insert_note(&mut tx, n)
            .await
            .with_context(|| format!("restoring note {}", n.id))?;
    }
    for g in &data.groups {
        snapshot::insert_group(&mut tx, g)
            .await
            .with_context(|| format!("restoring group {}", g.id))?;
    }
    for i in &data.items {
        snapshot::insert_item(&mut tx, i)
            .await
            .with_context(|| format!("restoring item {}", i.id))?;
    }

    let mut summary = RestoreSummary {
        groups: data.groups.len(),
        items: data.items.len(),
        quotes: data.quotes.len(),
        notes: data.notes.len(),
        requires_setup: true,
        ..Default::default()
    };
    if with_email {
        let mailboxes = data.mailboxes.as_deref().unwrap_or_default();
        let messages = data.messages.as_deref().unwrap_or_default();
        for m in mailboxes {
            snapshot::insert_mailbox(&mut tx, m)
                .await
                .with_context(|| format!("restoring mailbox {}", m.id))?;
        }
        for m in messages {
            snapshot::insert_message(&mut tx, m)
                .await
                .with_context(|| format!("restoring message {}", m.id))?;
        }
        summary.mailboxes = mailboxes.len();
        summary.messages = messages.len();
    }

    tx.commit().await?;
    info!(?summary, "restore committed");
    Ok(summary)
}

/// Every table a factory reset empties, children before parents.
const ALL_TABLES: [&str; 10] = [
    "messages",
    "mailboxes",
    "items",
    "groups",
    "notes",
    "quotes",
    "settings",
    "sessions",
    "users",
    "rate_limits",
];

/// Wipe everything after checking `password` against an admin account.
/// Used offline, where there is no signed-in user.
#[instrument(skip_all)]
pub async fn factory_reset(pool: &Pool, password: &str) -> Result<()> {
    let admins = db::list_admins(pool).await?;
    if !admins
        .iter()
        .any(|admin| verify_password(&admin.password_hash, password))
    {
        return Err(BackupError::WrongPassword.into());
    }
    wipe_all(pool).await
}

/// Wipe everything on behalf of `user`, who must be an admin confirming
/// with their own password.
#[instrument(skip_all, fields(user_id = user.id))]
pub async fn factory_reset_as(pool: &Pool, user: &User, password: &str) -> Result<()> {
    if !user.is_admin || !verify_password(&user.password_hash, password) {
        return Err(BackupError::WrongPassword.into());
    }
    wipe_all(pool).await
}

async fn wipe_all(pool: &Pool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ALL_TABLES {
        let deleted = clear_table(&mut tx, table).await?;
        info!(table, deleted, "factory reset: cleared");
    }
    sqlx::query("DELETE FROM sqlite_sequence")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("factory reset complete");
    Ok(())
}

/// Content tables cleared by a data reset. Users, settings, sessions and
/// the migration ledger are not in this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resettable {
    Messages,
    Mailboxes,
    Notes,
    Quotes,
    Items,
    Groups,
}

impl Resettable {
    pub const ALL: [Resettable; 6] = [
        Resettable::Messages,
        Resettable::Mailboxes,
        Resettable::Notes,
        Resettable::Quotes,
        Resettable::Items,
        Resettable::Groups,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Resettable::Messages => "messages",
            Resettable::Mailboxes => "mailboxes",
            Resettable::Notes => "notes",
            Resettable::Quotes => "quotes",
            Resettable::Items => "items",
            Resettable::Groups => "groups",
        }
    }
}

/// Empty every [`Resettable`] table in one transaction, confirm each is
/// empty, then reclaim space.
#[instrument(skip_all)]
pub async fn reset_data(pool: &Pool) -> Result<Vec<TableReport>> {
    let mut tx = pool.begin().await?;
    let mut report = Vec::with_capacity(Resettable::ALL.len());
    for entity in Resettable::ALL {
        let table = entity.table();
        let remaining = clear_and_verify(&mut tx, table).await?;
        report.push(TableReport { table, remaining });
    }
    tx.commit().await?;

    if let Err(err) = sqlx::query("VACUUM").execute(pool).await {
        warn!(?err, "vacuum after data reset failed");
    }
    info!(tables = report.len(), "data reset complete");
    Ok(report)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Snapshot files in one directory, capped at `max` files.
/// Clones share the creation lock.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    max: usize,
    create_lock: Arc<Mutex<()>>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, max: usize) -> Self {
        Self {
            dir: dir.into(),
            max,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !SNAPSHOT_NAME.is_match(name) {
            return Err(BackupError::InvalidName(name.to_string()).into());
        }
        Ok(self.dir.join(name))
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !SNAPSHOT_NAME.is_match(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(SnapshotInfo {
                name,
                size: meta.len(),
                created_at,
            });
        }
        out.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(out)
    }

    /// Write `envelope` to a new timestamped file unless the limit is reached.
    #[instrument(skip_all)]
    pub async fn create(&self, envelope: &Envelope) -> Result<SnapshotInfo> {
        // held until the file is written so the count check stays valid
        let _guard = self.create_lock.lock().await;
        let existing = self.list().await?.len();
        if existing >= self.max {
            return Err(BackupError::LimitReached(self.max).into());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut attempt = 0;
        let (name, mut file) = loop {
            let name = match attempt {
                0 => format!("snapshot-{}.json", stamp),
                n => format!("snapshot-{}-{}.json", stamp, n),
            };
            let path = self.path_for(&name)?;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (name, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 9 => {
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create {}", path.display()))
                }
            }
        };
        let body = serde_json::to_vec_pretty(envelope)?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        info!(%name, size = body.len(), "snapshot written");
        Ok(SnapshotInfo {
            name,
            size: body.len() as u64,
            created_at: Utc::now(),
        })
    }

    pub async fn read_raw(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::Missing(name.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, name: &str) -> Result<Envelope> {
        Envelope::from_slice(&self.read_raw(name).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(%name, "snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::Missing(name.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_requires_all_sections() {
        let err = Envelope::from_value(json!({"version": "1.0", "data": {}})).unwrap_err();
        match err.downcast_ref::<BackupError>() {
            Some(BackupError::InvalidEnvelope(msg)) => assert!(msg.contains("schema")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Envelope::from_value(json!([1, 2])).is_err());

        let ok = Envelope::from_value(json!({
            "version": "1.0",
            "schema": {"includesEmail": false},
            "data": {"groups": [], "items": []}
        }))
        .unwrap();
        assert!(!ok.schema.includes_email);
        assert!(ok.data.settings.is_none());
    }

    #[test]
    fn nested_group_in_items_is_ignored() {
        let env = Envelope::from_value(json!({
            "version": "1.0",
            "schema": {"includesEmail": false},
            "data": {"items": [{
                "id": 3, "title": "t", "notes": null, "status": "red", "order": 0,
                "dueDate": null, "groupId": 2,
                "group": {"id": 2, "name": "g"},
                "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"
            }]}
        }))
        .unwrap();
        assert_eq!(env.data.items[0].group_id, Some(2));
    }

    #[test]
    fn snapshot_names_are_checked() {
        let store = SnapshotStore::new("/tmp/none", 10);
        assert!(store.path_for("snapshot-20240101T120000000Z.json").is_ok());
        for bad in ["../etc/passwd", "snapshot-x.json", "snapshot-1.json.bak", "other.json"] {
            let err = store.path_for(bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<BackupError>(),
                Some(BackupError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn mail_tables_omitted_when_absent() {
        let env = Envelope {
            version: BACKUP_VERSION.into(),
            schema: SchemaInfo {
                includes_email: false,
            },
            data: SnapshotData::default(),
        };
        let value = serde_json::to_value(&env).unwrap();
        assert!(value["data"].get("mailboxes").is_none());
        assert_eq!(value["schema"]["includesEmail"], json!(false));
    }
}
