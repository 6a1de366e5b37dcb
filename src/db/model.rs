//! Repository-level view models and typed errors.
//!
//! Repositories return `anyhow::Result`; errors a caller needs to branch on
//! are concrete types here so they can be recovered with `downcast_ref`.

use serde::Serialize;
use thiserror::Error;

/// A row addressed by id does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity} {id} not found")]
pub struct NotFound {
    pub entity: &'static str,
    pub id: i64,
}

impl NotFound {
    pub fn new(entity: &'static str, id: i64) -> Self {
        Self { entity, id }
    }
}

/// Caller-supplied data failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct Invalid(pub String);

/// Trimmed value of a mandatory text field.
pub(crate) fn required(value: Option<&String>, field: &'static str) -> anyhow::Result<String> {
    match value.map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Invalid(format!("{} must be non-empty", field)).into()),
    }
}

/// Tables whose `order` column is rewritten by the reorder endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reorderable {
    Groups,
    Items,
    Mailboxes,
}

impl Reorderable {
    pub fn table(&self) -> &'static str {
        match self {
            Reorderable::Groups => "groups",
            Reorderable::Items => "items",
            Reorderable::Mailboxes => "mailboxes",
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Reorderable::Groups => "group",
            Reorderable::Items => "item",
            Reorderable::Mailboxes => "mailbox",
        }
    }
}

/// Row count of one table after a reset.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub table: &'static str,
    pub remaining: i64,
}
