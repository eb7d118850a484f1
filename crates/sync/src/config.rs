//! Sync layer configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! All variables are optional.
//!
//! - `PACKLINE_PAGE_SIZE` - Messages per page (default: 20)
//! - `PACKLINE_SEARCH_DEBOUNCE_MS` - Search-as-you-type delay (default: 500)
//! - `PACKLINE_NAME_CACHE_TTL_SECS` - Display name cache lifetime (default: 300)
//! - `PACKLINE_NAME_CACHE_CAPACITY` - Display name cache size (default: 1000)
//! - `PACKLINE_LOG_FILTER` - Default tracing filter when `RUST_LOG` is unset
//!   (default: `packline_sync=info`)
//! - `PACKLINE_LOG_JSON` - Emit JSON logs (default: false)
//! - `PACKLINE_STORAGE_BUCKET` - Blob storage bucket name (default: `packline-media`)

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::services::conversations::DEFAULT_PAGE_SIZE;
use crate::services::search::{DEFAULT_SEARCH_DEBOUNCE, DEFAULT_SEARCH_DEBOUNCE_MS};

const DEFAULT_NAME_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_NAME_CACHE_CAPACITY: u64 = 1000;
const DEFAULT_LOG_FILTER: &str = "packline_sync=info";
const DEFAULT_STORAGE_BUCKET: &str = "packline-media";

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Sync layer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages fetched per page
    pub page_size: usize,
    /// Delay before a search-as-you-type query fires
    pub search_debounce: Duration,
    /// Display name cache settings
    pub name_cache: NameCacheConfig,
    /// Logging settings
    pub log: LogConfig,
    /// Blob storage bucket for attachments and media
    pub storage_bucket: String,
}

/// Display name cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameCacheConfig {
    pub ttl: Duration,
    pub capacity: u64,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for NameCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_NAME_CACHE_TTL_SECS),
            capacity: DEFAULT_NAME_CACHE_CAPACITY,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
            name_cache: NameCacheConfig::default(),
            log: LogConfig::default(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but unparseable or out of
    /// range.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let page_size = get_parsed_or(&lookup, "PACKLINE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "PACKLINE_PAGE_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let search_debounce = Duration::from_millis(get_parsed_or(
            &lookup,
            "PACKLINE_SEARCH_DEBOUNCE_MS",
            DEFAULT_SEARCH_DEBOUNCE_MS,
        )?);
        let name_cache = NameCacheConfig {
            ttl: Duration::from_secs(get_parsed_or(
                &lookup,
                "PACKLINE_NAME_CACHE_TTL_SECS",
                DEFAULT_NAME_CACHE_TTL_SECS,
            )?),
            capacity: get_parsed_or(&lookup, "PACKLINE_NAME_CACHE_CAPACITY", DEFAULT_NAME_CACHE_CAPACITY)?,
        };
        let log = LogConfig {
            filter: get_optional(&lookup, "PACKLINE_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            json: get_parsed_or(&lookup, "PACKLINE_LOG_JSON", false)?,
        };
        let storage_bucket = get_optional(&lookup, "PACKLINE_STORAGE_BUCKET")
            .map_or_else(|| DEFAULT_STORAGE_BUCKET.to_string(), |bucket| bucket.trim().to_string());
        if storage_bucket.contains('/') {
            return Err(ConfigError::InvalidEnvVar(
                "PACKLINE_STORAGE_BUCKET".to_string(),
                "must be a single path segment".to_string(),
            ));
        }

        Ok(Self {
            page_size,
            search_debounce,
            name_cache,
            log,
            storage_bucket,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get an optional variable, treating blank values as unset.
fn get_optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.trim().is_empty())
}

/// Get a variable parsed with `FromStr`, or `default` when unset.
fn get_parsed_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional(lookup, key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    })
}
