//! Remote mailbox access.
//!
//! Every operation opens its own session through a [`MailConnector`], does one
//! thing and logs out again, whether or not that thing succeeded. There is no
//! pooling and no retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::model::Mailbox;

pub mod cache;
pub mod compose;
pub mod imap;

pub use cache::{CacheStatus, MailCache};
pub use imap::ImapConnector;

pub const SEEN: &str = "\\Seen";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("login failed: {0}")]
    Login(String),
    #[error("{op} failed: {reason}")]
    Command { op: &'static str, reason: String },
    #[error("mail server timed out")]
    Timeout,
    #[error("could not build message: {0}")]
    Compose(String),
    #[error("smtp relay failed: {0}")]
    Relay(String),
}

/// Credentials and folder for one remote mailbox.
#[derive(Clone, PartialEq, Eq)]
pub struct MailAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
}

impl std::fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAccount")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

impl From<&Mailbox> for MailAccount {
    fn from(m: &Mailbox) -> Self {
        Self {
            host: m.host.clone(),
            port: u16::try_from(m.port).unwrap_or(993),
            username: m.username.clone(),
            password: m.password.clone(),
            folder: m.folder.clone(),
        }
    }
}

/// Header fields of a message as seen on the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub seen: bool,
    pub flagged: bool,
}

#[async_trait]
pub trait MailSession: Send {
    /// The newest `limit` messages of `folder`, newest first.
    async fn fetch_recent(&mut self, folder: &str, limit: u32) -> Result<Vec<RemoteMessage>, MailError>;

    async fn add_flags(&mut self, folder: &str, uid: u32, flags: &str) -> Result<(), MailError>;

    async fn append(&mut self, folder: &str, flags: &str, content: &[u8]) -> Result<(), MailError>;

    async fn noop(&mut self) -> Result<(), MailError>;

    async fn logout(&mut self) -> Result<(), MailError>;
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, MailError>;
}

async fn close(mut session: Box<dyn MailSession>, account: &MailAccount) {
    if let Err(err) = session.logout().await {
        warn!(?err, host = %account.host, "logout failed");
    }
}

/// Log in and issue a NOOP.
#[instrument(skip_all, fields(host = %account.host))]
pub async fn test_connection(
    connector: &dyn MailConnector,
    account: &MailAccount,
) -> Result<(), MailError> {
    let mut session = connector.connect(account).await?;
    let result = session.noop().await;
    close(session, account).await;
    result
}

#[instrument(skip_all, fields(host = %account.host, folder = %account.folder))]
pub async fn fetch_recent(
    connector: &dyn MailConnector,
    account: &MailAccount,
    limit: u32,
) -> Result<Vec<RemoteMessage>, MailError> {
    let mut session = connector.connect(account).await?;
    let result = session.fetch_recent(&account.folder, limit).await;
    close(session, account).await;
    result
}

#[instrument(skip_all, fields(host = %account.host, uid))]
pub async fn mark_seen(
    connector: &dyn MailConnector,
    account: &MailAccount,
    uid: u32,
) -> Result<(), MailError> {
    let mut session = connector.connect(account).await?;
    let result = session.add_flags(&account.folder, uid, SEEN).await;
    close(session, account).await;
    result
}

/// Store a finished message in `folder` (e.g. the sent folder).
#[instrument(skip_all, fields(host = %account.host, folder))]
pub async fn append(
    connector: &dyn MailConnector,
    account: &MailAccount,
    folder: &str,
    content: &[u8],
) -> Result<(), MailError> {
    let mut session = connector.connect(account).await?;
    let result = session.append(folder, SEEN, content).await;
    close(session, account).await;
    result
}
