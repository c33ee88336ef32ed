/// Session configuration via `distill.toml`
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working in-process setup. Builders follow the `with_*` style for callers
/// that configure in code.

use crate::lifecycle::normalize_url;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default config file name
pub const CONFIG_FILE_NAME: &str = "distill.toml";

pub const DEFAULT_ALPHABET: &str = "abcdefghkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const DEFAULT_EXPIRED_REDIRECT_URL: &str = "https://github.com/noandrea/distill/wikis/Expired-URL";

/// Upper bound on alphabet size accepted by the id generator
pub const MAX_ALPHABET_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Directory holding the value log
    pub path: PathBuf,
    /// fsync every committed write
    pub sync_writes: bool,
    /// Keep everything in memory; nothing survives the session
    pub in_memory: bool,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("distill.db"),
            sync_writes: true,
            in_memory: false,
        }
    }
}

/// Short id generation and global record defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShortIdConfig {
    pub alphabet: String,
    pub length: usize,
    /// Default resolve limit for new records (0 = unlimited)
    pub max_requests: u64,
    /// Default ttl in seconds for new records (0 = none)
    pub ttl: u64,
    /// Default absolute expiration for new records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted_redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive_redirect_url: Option<String>,
    /// Caller-supplied ids must only use `alphabet`
    pub enforce_alphabet: bool,
    /// Caller-supplied ids must be exactly `length` characters
    pub enforce_length: bool,
}

impl Default for ShortIdConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            length: 6,
            max_requests: 0,
            ttl: 0,
            expire_on: None,
            expired_redirect_url: Some(DEFAULT_EXPIRED_REDIRECT_URL.to_string()),
            exhausted_redirect_url: None,
            inactive_redirect_url: None,
            enforce_alphabet: true,
            enforce_length: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Collect global statistics
    pub stats_enabled: bool,
    /// Number of stats worker threads
    pub stats_events_worker_num: usize,
    /// Capacity of the stats event queue; producers block when it is full
    pub stats_events_queue_size: usize,
    /// Recent delete and expired events remembered to skip duplicates
    pub stats_cache_size: usize,
    /// Deletes between two compaction passes
    pub db_gc_deletes_count: u64,
    /// Minimum garbage share that makes a compaction rewrite worthwhile
    pub db_gc_discard_ratio: f64,
    /// Records held by the write-back cache
    pub url_cache_size: usize,
    /// Attempts at drawing a free random id before giving up
    pub id_generation_retries: u32,
    /// Delete records once they are read past their expiration
    pub delete_expired: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            stats_enabled: true,
            stats_events_worker_num: 1,
            stats_events_queue_size: 1024,
            stats_cache_size: 1024,
            db_gc_deletes_count: 500,
            db_gc_discard_ratio: 0.5,
            url_cache_size: 2048,
            id_generation_retries: 32,
            delete_expired: true,
        }
    }
}

/// Configuration loaded from `distill.toml`.
///
/// # Example
///
/// ```toml
/// [datastore]
/// path = "distill.db"
///
/// [short_id]
/// length = 6
/// max_requests = 0
///
/// [tuning]
/// url_cache_size = 2048
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistillConfig {
    pub datastore: DatastoreConfig,
    pub short_id: ShortIdConfig,
    pub tuning: TuningConfig,
}

impl DistillConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a throwaway in-memory session
    pub fn in_memory() -> Self {
        Self::default().with_in_memory()
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.datastore.path = path.into();
        self.datastore.in_memory = false;
        self
    }

    pub fn with_in_memory(mut self) -> Self {
        self.datastore.in_memory = true;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.datastore.sync_writes = sync;
        self
    }

    /// Set the id alphabet and length together
    pub fn with_id_format(mut self, alphabet: impl Into<String>, length: usize) -> Self {
        self.short_id.alphabet = alphabet.into();
        self.short_id.length = length;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.short_id.max_requests = max_requests;
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.short_id.ttl = ttl;
        self
    }

    pub fn with_expire_on(mut self, expire_on: DateTime<Utc>) -> Self {
        self.short_id.expire_on = Some(expire_on);
        self
    }

    pub fn with_expired_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.short_id.expired_redirect_url = Some(url.into());
        self
    }

    pub fn with_exhausted_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.short_id.exhausted_redirect_url = Some(url.into());
        self
    }

    pub fn with_inactive_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.short_id.inactive_redirect_url = Some(url.into());
        self
    }

    /// Accept any caller-supplied id
    pub fn without_id_policy(mut self) -> Self {
        self.short_id.enforce_alphabet = false;
        self.short_id.enforce_length = false;
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.tuning.stats_enabled = enabled;
        self
    }

    pub fn with_stats_workers(mut self, workers: usize) -> Self {
        self.tuning.stats_events_worker_num = workers;
        self
    }

    pub fn with_stats_queue_size(mut self, size: usize) -> Self {
        self.tuning.stats_events_queue_size = size;
        self
    }

    /// Set the compaction trigger and discard ratio
    pub fn with_gc(mut self, deletes_count: u64, discard_ratio: f64) -> Self {
        self.tuning.db_gc_deletes_count = deletes_count;
        self.tuning.db_gc_discard_ratio = discard_ratio;
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.tuning.url_cache_size = size;
        self
    }

    pub fn with_id_generation_retries(mut self, retries: u32) -> Self {
        self.tuning.id_generation_retries = retries;
        self
    }

    pub fn with_delete_expired(mut self, delete: bool) -> Self {
        self.tuning.delete_expired = delete;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), String> {
        let short_id = &self.short_id;
        if short_id.length < 3 {
            return Err("short_id.length must be at least 3".to_string());
        }

        if !short_id.alphabet.is_ascii() {
            return Err("short_id.alphabet must only contain ASCII characters".to_string());
        }
        let distinct: HashSet<char> = short_id.alphabet.chars().collect();
        if distinct.len() < short_id.length {
            return Err(format!(
                "short_id.alphabet must have at least {} distinct characters",
                short_id.length
            ));
        }
        if short_id.alphabet.chars().count() > MAX_ALPHABET_LEN {
            return Err(format!(
                "short_id.alphabet must have at most {} characters",
                MAX_ALPHABET_LEN
            ));
        }

        for (name, url) in [
            ("expired_redirect_url", &short_id.expired_redirect_url),
            ("exhausted_redirect_url", &short_id.exhausted_redirect_url),
            ("inactive_redirect_url", &short_id.inactive_redirect_url),
        ] {
            if let Some(url) = url {
                normalize_url(url).map_err(|e| format!("short_id.{}: {}", name, e))?;
            }
        }

        let tuning = &self.tuning;
        if !(tuning.db_gc_discard_ratio > 0.0 && tuning.db_gc_discard_ratio <= 1.0) {
            return Err("tuning.db_gc_discard_ratio must be in (0, 1]".to_string());
        }
        if tuning.db_gc_deletes_count == 0 {
            return Err("tuning.db_gc_deletes_count must be greater than 0".to_string());
        }
        if tuning.stats_events_worker_num == 0 {
            return Err("tuning.stats_events_worker_num must be greater than 0".to_string());
        }
        if tuning.stats_events_queue_size == 0 {
            return Err("tuning.stats_events_queue_size must be greater than 0".to_string());
        }
        if tuning.stats_cache_size == 0 {
            return Err("tuning.stats_cache_size must be greater than 0".to_string());
        }
        if tuning.url_cache_size == 0 {
            return Err("tuning.url_cache_size must be greater than 0".to_string());
        }
        if tuning.id_generation_retries == 0 {
            return Err("tuning.id_generation_retries must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Distill configuration

[datastore]
# Directory holding the value log
path = "distill.db"
# fsync every write (slower, survives power loss)
sync_writes = true
# Keep all data in memory (nothing is persisted)
in_memory = false

[short_id]
alphabet = "abcdefghkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789"
length = 6
# Defaults applied when a request does not set them (0 = unlimited / never)
max_requests = 0
ttl = 0
# expire_on = "2030-01-01T00:00:00Z"
expired_redirect_url = "https://github.com/noandrea/distill/wikis/Expired-URL"
# exhausted_redirect_url = "https://example.com/exhausted"
# inactive_redirect_url = "https://example.com/not-yet"
# Policy for caller-supplied ids
enforce_alphabet = true
enforce_length = true

[tuning]
stats_enabled = true
stats_events_worker_num = 1
stats_events_queue_size = 1024
# Skip repeated delete/expired events for the same id within a minute
stats_cache_size = 1024
# Compact the value log every N deletes
db_gc_deletes_count = 500
db_gc_discard_ratio = 0.5
url_cache_size = 2048
id_generation_retries = 32
# Delete records read past their expiration
delete_expired = true
"#
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            Error::InvalidConfig(msg) => {
                Error::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse and validate config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DistillConfig =
            toml::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate().map_err(Error::InvalidConfig)?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns whether a file was created.
    pub fn write_default_if_missing(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        std::fs::write(path, Self::default_toml())?;
        Ok(true)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
