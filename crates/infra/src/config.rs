//! Engine configuration, loaded from `DEPOT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::TailerConfig;
use crate::store::sqlite::default_db_path;

pub const DEFAULT_JOURNAL_PATTERN: &str = "Journal.*.log";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("no platform data directory; set {0} explicitly")]
    NoDataDir(&'static str),
}

/// Which project store backend to run against.
///
/// Connection URLs may carry credentials; never log them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        sqlite_path: PathBuf,
    },
    Networked {
        primary_url: String,
        fallback_url: Option<String>,
        probe_interval: Duration,
        sticky_fallback: bool,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Local { .. } => "local",
            BackendConfig::Networked { .. } => "networked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub journal_dir: PathBuf,
    pub journal_pattern: String,
    pub cursor_path: PathBuf,
    /// Spacing between journal passes.
    pub poll_interval: Duration,
    pub tailer: TailerConfig,
    pub backend: BackendConfig,
}

impl EngineConfig {
    /// Defaults for everything but the journal directory. State files go
    /// under the platform data directory.
    pub fn new(journal_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Ok(Self {
            journal_dir: journal_dir.into(),
            journal_pattern: DEFAULT_JOURNAL_PATTERN.to_string(),
            cursor_path: default_cursor_path().ok_or(ConfigError::NoDataDir("DEPOT_CURSOR_PATH"))?,
            poll_interval: Duration::from_secs(5),
            tailer: TailerConfig::default(),
            backend: BackendConfig::Local {
                sqlite_path: default_db_path().ok_or(ConfigError::NoDataDir("DEPOT_SQLITE_PATH"))?,
            },
        })
    }

    pub fn with_journal_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.journal_pattern = pattern.into();
        self
    }

    pub fn with_cursor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cursor_path = path.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_tailer(mut self, tailer: TailerConfig) -> Self {
        self.tailer = tailer;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let journal_dir = get("DEPOT_JOURNAL_DIR").ok_or(ConfigError::Missing("DEPOT_JOURNAL_DIR"))?;

        let journal_pattern = get("DEPOT_JOURNAL_PATTERN").unwrap_or_else(|| DEFAULT_JOURNAL_PATTERN.to_string());
        if glob::Pattern::new(&journal_pattern).is_err() {
            return Err(ConfigError::Invalid {
                key: "DEPOT_JOURNAL_PATTERN",
                value: journal_pattern,
                reason: "not a valid glob pattern",
            });
        }

        let cursor_path = match get("DEPOT_CURSOR_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_cursor_path().ok_or(ConfigError::NoDataDir("DEPOT_CURSOR_PATH"))?,
        };

        let poll_secs = parse_u64("DEPOT_POLL_SECS", get("DEPOT_POLL_SECS"), 5)?;
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "DEPOT_POLL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1",
            });
        }

        let tailer = TailerConfig {
            retry_attempts: parse_u64("DEPOT_TAIL_RETRIES", get("DEPOT_TAIL_RETRIES"), 5)?.clamp(1, u32::MAX as u64)
                as u32,
            retry_delay: Duration::from_millis(parse_u64("DEPOT_TAIL_RETRY_MS", get("DEPOT_TAIL_RETRY_MS"), 250)?),
            full_reread_on_idle: parse_bool(
                "DEPOT_FULL_REREAD_ON_IDLE",
                get("DEPOT_FULL_REREAD_ON_IDLE"),
                true,
            )?,
        };

        let backend = match get("DEPOT_BACKEND").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("local") => BackendConfig::Local {
                sqlite_path: match get("DEPOT_SQLITE_PATH") {
                    Some(path) => PathBuf::from(path),
                    None => default_db_path().ok_or(ConfigError::NoDataDir("DEPOT_SQLITE_PATH"))?,
                },
            },
            Some("networked") => BackendConfig::Networked {
                primary_url: get("DEPOT_PRIMARY_URL").ok_or(ConfigError::Missing("DEPOT_PRIMARY_URL"))?,
                fallback_url: get("DEPOT_FALLBACK_URL"),
                probe_interval: Duration::from_secs(parse_u64("DEPOT_PROBE_SECS", get("DEPOT_PROBE_SECS"), 20)?),
                sticky_fallback: parse_bool("DEPOT_STICKY_FALLBACK", get("DEPOT_STICKY_FALLBACK"), false)?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DEPOT_BACKEND",
                    value: other.to_string(),
                    reason: "expected 'local' or 'networked'",
                });
            }
        };

        Ok(Self {
            journal_dir: PathBuf::from(journal_dir),
            journal_pattern,
            cursor_path,
            poll_interval: Duration::from_secs(poll_secs),
            tailer,
            backend,
        })
    }
}

/// Default cursor location: `{data_dir}/depot-ledger/cursor.txt`.
pub fn default_cursor_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("depot-ledger").join("cursor.txt"))
}

fn parse_u64(key: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected true or false",
        }),
    }
}
