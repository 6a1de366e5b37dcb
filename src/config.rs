//! Configuration loader and validator for the Congeal server.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub backup: Backup,
    #[serde(default)]
    pub mail: Mail,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Static files: the client bundle plus uploads.
    pub public_dir: String,
    pub listen: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backup {
    pub max_snapshots: usize,
    pub include_email: bool,
}

impl Default for Backup {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            include_email: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub cache_ttl_seconds: u64,
    pub timeout_seconds: u64,
    pub fetch_limit: u32,
    pub sent_folder: String,
}

impl Default for Mail {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            timeout_seconds: 30,
            fetch_limit: 50,
            sent_folder: "Sent".into(),
        }
    }
}

/// Fixed-window limit applied to `/api/auth/*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub window_seconds: u64,
    pub max_requests: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 10,
        }
    }
}

/// Outgoing relay. Without it replies are only stored in the sent folder.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

fn default_session_ttl_hours() -> u64 {
    24 * 7
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.data_dir)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir().join("snapshots")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    pub fn public_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.public_dir)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.public_dir().join("uploads")
    }

    /// Create the data, snapshot, cache and upload directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [
            self.data_dir(),
            self.snapshots_dir(),
            self.cache_dir(),
            self.uploads_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.public_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.public_dir must be non-empty"));
    }
    if cfg.app.listen.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.listen must be a socket address"));
    }
    if cfg.app.session_ttl_hours == 0 {
        return Err(ConfigError::Invalid("app.session_ttl_hours must be > 0"));
    }

    if cfg.backup.max_snapshots == 0 {
        return Err(ConfigError::Invalid("backup.max_snapshots must be > 0"));
    }

    if cfg.mail.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("mail.timeout_seconds must be > 0"));
    }
    if cfg.mail.fetch_limit == 0 {
        return Err(ConfigError::Invalid("mail.fetch_limit must be > 0"));
    }
    if cfg.mail.sent_folder.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.sent_folder must be non-empty"));
    }
    // cache_ttl_seconds = 0 disables the cache

    if cfg.rate_limit.window_seconds == 0 {
        return Err(ConfigError::Invalid("rate_limit.window_seconds must be > 0"));
    }
    if cfg.rate_limit.max_requests == 0 {
        return Err(ConfigError::Invalid("rate_limit.max_requests must be > 0"));
    }

    if let Some(smtp) = &cfg.smtp {
        if smtp.host.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.host must be non-empty"));
        }
        if smtp.from.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.from must be non-empty"));
        }
    }

    Ok(())
}

/// A complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  public_dir: "./public"
  listen: "127.0.0.1:3000"
  session_ttl_hours: 168

backup:
  max_snapshots: 10
  include_email: true

mail:
  cache_ttl_seconds: 300
  timeout_seconds: 30
  fetch_limit: 50
  sent_folder: "Sent"

rate_limit:
  window_seconds: 60
  max_requests: 10

smtp:
  host: "smtp.example.org"
  port: 587
  username: "congeal@example.org"
  password: "YOUR_SMTP_PASSWORD"
  from: "Congeal <congeal@example.org>"
"#
}
