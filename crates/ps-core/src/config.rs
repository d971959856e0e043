use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.periscope/config.toml`.
///
/// Every section falls back to its defaults when omitted, so an empty file
/// (or no file at all) yields a working setup on the standard ports.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `~/.periscope/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.flood.validate()?;
        self.queue.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".periscope").join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_insecure_port")]
    pub insecure_port: u16,
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    /// Upper bound on the `getPlugins` negotiation of a new secure connection.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            insecure_port: default_insecure_port(),
            secure_port: default_secure_port(),
            init_timeout_secs: default_init_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn insecure_addr(&self) -> String {
        format!("{}:{}", self.host, self.insecure_port)
    }

    pub fn secure_addr(&self) -> String {
        format!("{}:{}", self.host, self.secure_port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.insecure_port == 0 || self.secure_port == 0 {
            return Err(ConfigError::Validation(
                "server ports must be non-zero".into(),
            ));
        }
        if self.insecure_port == self.secure_port {
            return Err(ConfigError::Validation(format!(
                "insecure_port and secure_port must differ (both {})",
                self.secure_port
            )));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Validation(
                "max_frame_bytes must be at least 1024".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_insecure_port() -> u16 {
    8089
}
fn default_secure_port() -> u16 {
    8088
}
fn default_init_timeout_secs() -> u64 {
    30
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertsConfig {
    #[serde(default = "default_certs_dir")]
    pub dir: String,
    /// Binary used to sign CSRs and mint the local CA.
    #[serde(default = "default_openssl")]
    pub openssl: String,
    /// Reject secure connections from devices that never bootstrapped.
    #[serde(default = "default_true")]
    pub require_known_device: bool,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            dir: default_certs_dir(),
            openssl: default_openssl(),
            require_known_device: true,
        }
    }
}

impl CertsConfig {
    pub fn dir_path(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

fn default_certs_dir() -> String {
    "~/.periscope/certs".into()
}
fn default_openssl() -> String {
    "openssl".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FloodConfig {
    #[serde(default = "default_flood_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_flood_threshold")]
    pub threshold: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            window_secs: default_flood_window_secs(),
            threshold: default_flood_threshold(),
        }
    }
}

impl FloodConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs == 0 {
            return Err(ConfigError::Validation(
                "flood.window_secs must be greater than zero".into(),
            ));
        }
        if self.threshold == 0 {
            return Err(ConfigError::Validation(
                "flood.threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_flood_window_secs() -> u64 {
    20
}
fn default_flood_threshold() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Per-call reducer budget; slower reducer calls are logged.
    #[serde(default = "default_reducer_budget_ms")]
    pub reducer_budget_ms: u64,
    /// Work slice a drain performs before yielding.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reducer_budget_ms: default_reducer_budget_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            warn_threshold: default_warn_threshold(),
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "queue.idle_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_reducer_budget_ms() -> u64 {
    25
}
fn default_idle_interval_ms() -> u64 {
    16
}
fn default_warn_threshold() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
