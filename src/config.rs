//! Run configuration shared by every pipeline component.
//!
//! All knobs that were once module-level constants live in
//! [`HarvesterConfig`], which is built once (usually from CLI flags) and
//! handed to the fetch client, parser and sinks at construction.

use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://www.itiner-e.org";
pub const DEFAULT_BULK_ENDPOINT: &str = "/route-segments/download";
pub const DEFAULT_USER_AGENT: &str = "RomanRoadsHarvester/1.0 (GIS research)";

/// CRS of all Itiner-e geometries (WGS 84).
pub const WGS84_SRID: i32 = 4326;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid SQL identifier for {what}: '{value}'")]
    InvalidIdentifier { what: &'static str, value: String },

    #[error("Invalid base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Retry behaviour for HTTP requests.
///
/// Only statuses listed in `retry_statuses` are retried. The delay before
/// retry `n` (1-based) is `initial_backoff * 2^(n-1)`, capped at
/// `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Backoff before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Names of the two output layers / tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub segments: String,
    pub places: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            segments: "roman_road_segments".to_string(),
            places: "roman_road_places".to_string(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("segments table", &self.segments)?;
        validate_identifier("places table", &self.places)
    }
}

#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub base_url: String,
    pub bulk_endpoint_path: String,
    /// Minimum pause between consecutive single-segment requests.
    pub request_delay: Duration,
    pub request_timeout: Duration,
    pub bulk_timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
    pub tables: TableNames,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            bulk_endpoint_path: DEFAULT_BULK_ENDPOINT.to_string(),
            request_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            bulk_timeout: Duration::from_secs(300),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
            tables: TableNames::default(),
        }
    }
}

impl HarvesterConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        if !self.bulk_endpoint_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                name: "bulk_endpoint_path",
                reason: "must start with '/'".to_string(),
            });
        }
        self.tables.validate()
    }

    pub fn segment_json_url(&self, segment_id: i64) -> String {
        format!("{}/route-segment/{}/json", self.base_url, segment_id)
    }

    /// Human-facing page for a segment, stored alongside each feature.
    pub fn segment_page_url(&self, segment_id: i64) -> String {
        format!("{}/route-segment/{}", self.base_url, segment_id)
    }

    pub fn bulk_url(&self) -> String {
        format!("{}{}", self.base_url, self.bulk_endpoint_path)
    }
}

/// What to do when a target table already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConflictPolicy {
    #[default]
    Replace,
    Append,
    Fail,
}

/// PostGIS connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub schema: String,
    pub if_exists: ConflictPolicy,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: "public".to_string(),
            if_exists: ConflictPolicy::Replace,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.if_exists = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("schema", &self.schema)
    }
}

/// Resolves the database URL: an explicit URL wins, otherwise it is built
/// from the libpq environment variables.
pub fn database_url(explicit: Option<&str>) -> String {
    database_url_with(explicit, |key| std::env::var(key).ok())
}

pub(crate) fn database_url_with<F>(explicit: Option<&str>, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = explicit {
        return url.to_string();
    }
    let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
    format!(
        "postgresql://{}:{}@{}:{}/{}",
        var("PGUSER", "postgres"),
        var("PGPASSWORD", ""),
        var("PGHOST", "localhost"),
        var("PGPORT", "5432"),
        var("PGDATABASE", "roman_roads"),
    )
}

/// Table and schema names are interpolated into DDL, so they are limited
/// to plain lowercase identifiers.
pub fn validate_identifier(what: &'static str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && value.len() <= 63 {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}
