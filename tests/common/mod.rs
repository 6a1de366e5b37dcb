#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt;

use congeal::config::{App, Backup, Config, Mail, RateLimit};
use congeal::db::{self, Pool};
use congeal::handlers::{self, AppState};
use congeal::mail::{MailAccount, MailConnector, MailError, MailSession, RemoteMessage};

pub const ADMIN: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct horse battery";

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        app: App {
            data_dir: dir.join("data").to_string_lossy().to_string(),
            public_dir: dir.join("public").to_string_lossy().to_string(),
            listen: "127.0.0.1:0".into(),
            session_ttl_hours: 1,
        },
        backup: Backup::default(),
        mail: Mail::default(),
        rate_limit: RateLimit {
            window_seconds: 60,
            max_requests: 1000,
        },
        smtp: None,
    }
}

pub fn remote(uid: u32, subject: &str) -> RemoteMessage {
    RemoteMessage {
        uid,
        message_id: Some(format!("<{}@example.org>", uid)),
        subject: subject.to_string(),
        sender: "Alice <alice@example.org>".to_string(),
        date: None,
        seen: false,
        flagged: false,
    }
}

/// Server-side state shared by every session the fake hands out.
#[derive(Debug, Default)]
pub struct FakeServer {
    pub messages: Vec<RemoteMessage>,
    pub appended: Vec<(String, String, Vec<u8>)>,
    pub connects: usize,
    pub logouts: usize,
    pub fail_connect: bool,
    pub fail_commands: bool,
}

#[derive(Clone, Default)]
pub struct FakeMail {
    pub server: Arc<Mutex<FakeServer>>,
}

impl FakeMail {
    pub fn with_messages(messages: Vec<RemoteMessage>) -> Self {
        let fake = Self::default();
        fake.server.try_lock().unwrap().messages = messages;
        fake
    }

    pub async fn counts(&self) -> (usize, usize) {
        let s = self.server.lock().await;
        (s.connects, s.logouts)
    }
}

#[async_trait]
impl MailConnector for FakeMail {
    async fn connect(&self, _account: &MailAccount) -> Result<Box<dyn MailSession>, MailError> {
        let mut s = self.server.lock().await;
        if s.fail_connect {
            return Err(MailError::Connect("connection refused".into()));
        }
        s.connects += 1;
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
        }))
    }
}

struct FakeSession {
    server: Arc<Mutex<FakeServer>>,
}

fn failed(op: &'static str) -> MailError {
    MailError::Command {
        op,
        reason: "injected failure".into(),
    }
}

#[async_trait]
impl MailSession for FakeSession {
    async fn fetch_recent(&mut self, _folder: &str, limit: u32) -> Result<Vec<RemoteMessage>, MailError> {
        let s = self.server.lock().await;
        if s.fail_commands {
            return Err(failed("FETCH"));
        }
        let mut out = s.messages.clone();
        out.sort_by(|a, b| b.uid.cmp(&a.uid));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn add_flags(&mut self, _folder: &str, uid: u32, flags: &str) -> Result<(), MailError> {
        let mut s = self.server.lock().await;
        if s.fail_commands {
            return Err(failed("STORE"));
        }
        let msg = s
            .messages
            .iter_mut()
            .find(|m| m.uid == uid)
            .ok_or_else(|| failed("STORE"))?;
        if flags.contains("\\Seen") {
            msg.seen = true;
        }
        Ok(())
    }

    async fn append(&mut self, folder: &str, flags: &str, content: &[u8]) -> Result<(), MailError> {
        let mut s = self.server.lock().await;
        if s.fail_commands {
            return Err(failed("APPEND"));
        }
        s.appended
            .push((folder.to_string(), flags.to_string(), content.to_vec()));
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), MailError> {
        let s = self.server.lock().await;
        if s.fail_commands {
            return Err(failed("NOOP"));
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        self.server.lock().await.logouts += 1;
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub mail: FakeMail,
    pub dir: TempDir,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(FakeMail::default(), |_| {}).await
}

pub async fn spawn_app_with(mail: FakeMail, tweak: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    tweak(&mut cfg);
    cfg.ensure_dirs().unwrap();
    let pool = setup_pool().await;
    let state = AppState::new(pool, cfg, Arc::new(mail.clone()));
    TestApp {
        router: handlers::router(state.clone()),
        state,
        mail,
        dir,
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    /// `auth-token=<value>` from a Set-Cookie header, ready for a Cookie header.
    pub fn session_cookie(&self) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("auth-token="))
            .and_then(|v| v.split(';').next())
            .map(str::to_string)
    }
}

impl TestApp {
    pub async fn send(&self, req: Request<Body>) -> Reply {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).to_string())
            })
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        cookie: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(req).await
    }

    /// Run first-time setup and return the session cookie.
    pub async fn setup_admin(&self) -> String {
        let reply = self
            .call(
                Method::POST,
                "/api/auth/setup",
                None,
                Some(serde_json::json!({ "username": ADMIN, "password": ADMIN_PASSWORD })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{:?}", reply.body);
        reply.session_cookie().expect("setup sets a session cookie")
    }
}
