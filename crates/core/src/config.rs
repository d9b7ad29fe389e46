//! TOML-based configuration system for shelfsync.
//!
//! All sensitive values (API tokens) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::scheduler::RefreshInterval;

/// Page size used by paginated adapters unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Seconds allowed for a whole Audiobookshelf request, body included.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Seconds allowed to establish a connection to the Audiobookshelf server.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Web API settings.
    #[serde(default)]
    pub web: WebConfig,

    /// External library providers.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (catalog database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional directory for daily-rolling log files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Refresh interval used until an operator stores one in settings.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shelfsync")
}
fn default_refresh_interval() -> String {
    "disabled".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_dir: None,
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl DaemonConfig {
    /// Path of the catalog database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("shelfsync.db")
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

/// Web API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Provider sections. A missing section means the provider is not wired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub audiobookshelf: Option<AudiobookshelfConfig>,

    #[serde(default)]
    pub calibre: Option<CalibreConfig>,
}

/// Audiobookshelf server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudiobookshelfConfig {
    /// Server base URL (e.g. `https://abs.example.com`).
    pub url: String,

    /// Environment variable holding the API token.
    pub token_env: String,

    /// Library ids to sync. Empty means every book library on the server.
    #[serde(default)]
    pub library_ids: Vec<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Deadline for one API request. A stalled server fails the pass
    /// instead of leaving it running.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

/// Calibre library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibreConfig {
    /// Calibre library directory (the one containing `metadata.db`).
    pub library_path: PathBuf,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning and leaves the provider
    /// unconfigured rather than failing.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref mut abs) = self.providers.audiobookshelf {
            abs.token = resolve_optional_env(&abs.token_env, "providers.audiobookshelf.token_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.listen.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "web.listen".into(),
                detail: "listen address must not be empty".into(),
            });
        }
        if let Err(e) = RefreshInterval::parse(&self.daemon.refresh_interval) {
            return Err(ConfigError::InvalidValue {
                field: "daemon.refresh_interval".into(),
                detail: e.to_string(),
            });
        }
        if let Some(ref abs) = self.providers.audiobookshelf {
            if abs.url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "providers.audiobookshelf.url".into(),
                    detail: "server URL must not be empty".into(),
                });
            }
            if abs.page_size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "providers.audiobookshelf.page_size".into(),
                    detail: "page size must be > 0".into(),
                });
            }
            if abs.request_timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "providers.audiobookshelf.request_timeout_secs".into(),
                    detail: "timeout must be > 0".into(),
                });
            }
            if abs.connect_timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "providers.audiobookshelf.connect_timeout_secs".into(),
                    detail: "timeout must be > 0".into(),
                });
            }
        }
        if let Some(ref calibre) = self.providers.calibre {
            if calibre.page_size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "providers.calibre.page_size".into(),
                    detail: "page size must be > 0".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
