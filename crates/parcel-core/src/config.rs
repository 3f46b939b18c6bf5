use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8095;
pub const DEFAULT_MAX_CONCURRENCY: usize = 1024;
pub const DEFAULT_CHUNK_KB: usize = 64;
pub const DEFAULT_NOTIFY_TEMPLATE: &str = "download-complete";
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AssetsConfig {
    pub dir: PathBuf,
    /// Read size per streamed chunk, in KiB.
    pub chunk_kb: usize,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("assets"),
            chunk_kb: DEFAULT_CHUNK_KB,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving completion notifications; log-only when unset.
    pub webhook_url: Option<String>,
    pub template: String,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            template: DEFAULT_NOTIFY_TEMPLATE.into(),
            timeout_secs: DEFAULT_NOTIFY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ParcelConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub assets: AssetsConfig,
    pub notify: NotifyConfig,
}

impl ParcelConfig {
    /// Load `PARCEL_CONFIG` (when set) and apply `PARCEL_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("PARCEL_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get("PARCEL_BIND") {
            self.server.bind = bind.trim().to_string();
        }
        if let Some(raw) = get("PARCEL_PORT") {
            self.server.port = parse_num("PARCEL_PORT", &raw)?;
        }
        if let Some(raw) = get("PARCEL_HTTP_MAX_CONC") {
            self.server.max_concurrency = parse_num("PARCEL_HTTP_MAX_CONC", &raw)?;
        }
        if let Some(dir) = get("PARCEL_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("PARCEL_ASSETS_DIR") {
            self.assets.dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("PARCEL_CHUNK_KB") {
            self.assets.chunk_kb = parse_num("PARCEL_CHUNK_KB", &raw)?;
        }
        if let Some(url) = get("PARCEL_NOTIFY_URL") {
            self.notify.webhook_url = Some(url.trim().to_string());
        }
        if let Some(template) = get("PARCEL_NOTIFY_TEMPLATE") {
            self.notify.template = template.trim().to_string();
        }
        if let Some(raw) = get("PARCEL_NOTIFY_TIMEOUT_SECS") {
            self.notify.timeout_secs = parse_num("PARCEL_NOTIFY_TIMEOUT_SECS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "server.max_concurrency",
                value: "0".into(),
            });
        }
        if self.assets.chunk_kb == 0 {
            return Err(ConfigError::Invalid {
                key: "assets.chunk_kb",
                value: "0".into(),
            });
        }
        if self.notify.template.is_empty() {
            return Err(ConfigError::Invalid {
                key: "notify.template",
                value: String::new(),
            });
        }
        self.socket_addr().map(|_| ())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.server.bind.trim();
        let joined = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.server.port)
        } else {
            format!("{}:{}", host, self.server.port)
        };
        joined.parse().map_err(|_| ConfigError::Invalid {
            key: "PARCEL_BIND",
            value: self.server.bind.clone(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.assets.chunk_kb.saturating_mul(1024)
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}
