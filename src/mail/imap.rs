use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{MailAccount, MailConnector, MailError, MailSession, RemoteMessage};

// An IMAP session over TLS-encrypted TCP, wrapped in the tokio compat layer.
type Session = async_imap::Session<TlsStream<Compat<TcpStream>>>;

const FETCH_QUERY: &str = "(UID FLAGS ENVELOPE)";

/// Opens TLS IMAP sessions. Every network step is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    timeout: Duration,
}

impl ImapConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

async fn within<F: Future>(limit: Duration, fut: F) -> Result<F::Output, MailError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MailError::Timeout)
}

fn command(op: &'static str, err: async_imap::error::Error) -> MailError {
    MailError::Command {
        op,
        reason: err.to_string(),
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, MailError> {
        info!(host = %account.host, port = account.port, "connecting to IMAP server");
        let tcp = within(
            self.timeout,
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await?
        .map_err(|e| MailError::Connect(e.to_string()))?;

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = within(self.timeout, tls.connect(account.host.as_str(), tcp.compat()))
            .await?
            .map_err(|e| MailError::Connect(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);
        let session = within(
            self.timeout,
            client.login(&account.username, &account.password),
        )
        .await?
        .map_err(|(e, _)| MailError::Login(e.to_string()))?;

        Ok(Box::new(ImapSession {
            inner: Some(session),
            timeout: self.timeout,
        }))
    }
}

pub struct ImapSession {
    inner: Option<Session>,
    timeout: Duration,
}

impl ImapSession {
    fn session(&mut self) -> Result<&mut Session, MailError> {
        self.inner.as_mut().ok_or(MailError::Command {
            op: "session",
            reason: "already logged out".into(),
        })
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn fetch_recent(&mut self, folder: &str, limit: u32) -> Result<Vec<RemoteMessage>, MailError> {
        let timeout = self.timeout;
        let session = self.session()?;
        let mailbox = within(timeout, session.select(folder))
            .await?
            .map_err(|e| command("SELECT", e))?;
        if mailbox.exists == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let start = mailbox.exists.saturating_sub(limit - 1).max(1);
        let range = format!("{}:{}", start, mailbox.exists);
        debug!(folder, %range, "fetching envelopes");
        let fetches: Vec<Fetch> = within(timeout, async {
            let stream = session.fetch(&range, FETCH_QUERY).await?;
            stream.try_collect::<Vec<Fetch>>().await
        })
        .await?
        .map_err(|e| command("FETCH", e))?;

        let mut messages: Vec<RemoteMessage> = fetches.iter().filter_map(parse_fetch).collect();
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));
        Ok(messages)
    }

    async fn add_flags(&mut self, folder: &str, uid: u32, flags: &str) -> Result<(), MailError> {
        let timeout = self.timeout;
        let session = self.session()?;
        within(timeout, session.select(folder))
            .await?
            .map_err(|e| command("SELECT", e))?;
        let query = format!("+FLAGS ({})", flags);
        within(timeout, async {
            let stream = session.uid_store(uid.to_string(), &query).await?;
            stream.try_collect::<Vec<Fetch>>().await
        })
        .await?
        .map_err(|e| command("STORE", e))?;
        Ok(())
    }

    async fn append(&mut self, folder: &str, flags: &str, content: &[u8]) -> Result<(), MailError> {
        let timeout = self.timeout;
        let session = self.session()?;
        let before = within(timeout, session.select(folder))
            .await?
            .map_err(|e| command("SELECT", e))?;
        within(timeout, session.append(folder, content))
            .await?
            .map_err(|e| command("APPEND", e))?;
        if flags.is_empty() {
            return Ok(());
        }

        // APPEND carries no flags here; find the stored copy and STORE them.
        let Some(query) = appended_query(content, before.uid_next) else {
            warn!(folder, "appended message cannot be located, flags not set");
            return Ok(());
        };
        let mut uids: Vec<u32> = within(timeout, session.uid_search(&query))
            .await?
            .map_err(|e| command("SEARCH", e))?
            .into_iter()
            .collect();
        if uids.is_empty() {
            warn!(folder, %query, "appended message not found, flags not set");
            return Ok(());
        }
        uids.sort_unstable();
        let set = uid_set(&uids);
        let store = format!("+FLAGS ({})", flags);
        within(timeout, async {
            let stream = session.uid_store(&set, &store).await?;
            stream.try_collect::<Vec<Fetch>>().await
        })
        .await?
        .map_err(|e| command("STORE", e))?;
        debug!(folder, %set, "flags set on appended message");
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), MailError> {
        let timeout = self.timeout;
        let session = self.session()?;
        within(timeout, session.noop())
            .await?
            .map_err(|e| command("NOOP", e))
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        let Some(mut session) = self.inner.take() else {
            return Ok(());
        };
        within(self.timeout, session.logout())
            .await?
            .map_err(|e| command("LOGOUT", e))
    }
}

/// `UID SEARCH` keys matching a message just appended: its Message-ID,
/// narrowed to UIDs at or above the folder's UIDNEXT from before the append.
fn appended_query(content: &[u8], uid_next: Option<u32>) -> Option<String> {
    let message_id = mailparse::parse_headers(content)
        .ok()
        .and_then(|(headers, _)| headers.get_first_value("Message-ID"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let range = uid_next.map(|next| format!("UID {}:*", next));
    match (range, message_id) {
        (Some(range), Some(id)) => Some(format!("{} HEADER Message-ID {}", range, quoted(&id))),
        (None, Some(id)) => Some(format!("HEADER Message-ID {}", quoted(&id))),
        (Some(range), None) => Some(range),
        (None, None) => None,
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn lossy(bytes: &Option<Cow<'_, [u8]>>) -> Option<String> {
    bytes
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).to_string())
}

fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let ts = mailparse::dateparse(raw).ok()?;
    Utc.timestamp_opt(ts, 0).single()
}

fn parse_fetch(fetch: &Fetch) -> Option<RemoteMessage> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let subject = lossy(&envelope.subject)
        .map(|s| decode_rfc2047(&s))
        .unwrap_or_default();
    let message_id = lossy(&envelope.message_id).filter(|s| !s.is_empty());
    let date = lossy(&envelope.date).and_then(|d| parse_date(&d));

    let sender = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(|addr| {
            let mailbox = lossy(&addr.mailbox).unwrap_or_default();
            let host = lossy(&addr.host).unwrap_or_default();
            let email = format!("{}@{}", mailbox, host);
            match lossy(&addr.name).map(|n| decode_rfc2047(&n)) {
                Some(name) if !name.is_empty() => format!("{} <{}>", name, email),
                _ => email,
            }
        })
        .unwrap_or_default();

    let mut seen = false;
    let mut flagged = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => seen = true,
            Flag::Flagged => flagged = true,
            _ => {}
        }
    }

    Some(RemoteMessage {
        uid,
        message_id,
        subject,
        sender,
        date,
        seen,
        flagged,
    })
}
