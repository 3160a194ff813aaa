//! Configuration for loopscope
//!
//! Settings are layered: built-in defaults, then an optional `loopscope.toml`
//! in the working directory, then `LOOPSCOPE_*` environment variables (a
//! `.env` file is loaded first when present).

use crate::error::{Error, Result};
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default database file, relative to the working directory
pub const DEFAULT_DB_PATH: &str = "loopscope.db";

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "loopscope.toml";

/// Prefix for environment overrides (`LOOPSCOPE_DB_PATH`, ...)
pub const ENV_PREFIX: &str = "LOOPSCOPE";

/// Storage and runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path of the SQLite database file
    pub db_path: PathBuf,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout_ms: u64,
    /// Open connections in write-ahead-log mode
    pub wal: bool,
    /// Rows fetched per round trip by the lazy iterators
    pub iter_batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            busy_timeout_ms: 5_000,
            wal: true,
            iter_batch_size: 256,
        }
    }
}

impl Settings {
    /// Create settings for a specific database file
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load settings from `loopscope.toml` and the environment
    pub fn load() -> Result<Self> {
        // Load .env if present so local development picks up LOOPSCOPE_* overrides
        let _ = dotenv();
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from a specific configuration file and the environment
    ///
    /// The file is optional; its format is inferred from the extension.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()
    }

    /// Check that the settings are usable
    pub fn validate(self) -> Result<Self> {
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::config("db_path must not be empty"));
        }
        if self.iter_batch_size == 0 {
            return Err(Error::config("iter_batch_size must be at least 1"));
        }
        Ok(self)
    }

    /// Set the database path
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Set the busy timeout
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable write-ahead logging
    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    /// Set the iterator batch size
    pub fn with_iter_batch_size(mut self, size: usize) -> Self {
        self.iter_batch_size = size;
        self
    }

    /// Busy timeout as a duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
