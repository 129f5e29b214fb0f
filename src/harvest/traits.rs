//! Core traits and error types for the harvest pipeline.
//!
//! This module defines the foundational pieces shared by every stage:
//! - Synchronous stage abstraction via [`HarvestStage`]
//! - The error taxonomy for fetching, parsing and writing

use thiserror::Error;

use crate::config::ConfigError;

// ============================================================================
// Pipeline Trait
// ============================================================================

/// Generic pipeline stage that transforms Input → Output.
///
/// CPU-bound stages (record parsing, aggregation) implement this trait so
/// the pipeline can run them uniformly and log them by name.
///
/// # Idempotence
///
/// Implementations must be pure with respect to their input: the same
/// input always yields an equal output.
pub trait HarvestStage: Send + Sync {
    /// Input type consumed by this stage
    type Input;

    /// Output type produced by this stage
    type Output;

    /// Error type for stage failures
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;

    /// Returns a human-readable name for this stage, used in logs.
    fn stage_name(&self) -> &'static str;
}

// ============================================================================
// Error Types
// ============================================================================

/// Outcome of a failed HTTP fetch.
///
/// Callers decide what to do with each variant: batch runs skip
/// `NotFound` and keep going on the other two.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The remote answered 404
    #[error("Not found: {url}")]
    NotFound { url: String },

    /// A retryable status persisted through every retry
    #[error("Transient failure for {url}: HTTP {status} after {attempts} attempts")]
    TransientFailure {
        url: String,
        status: u16,
        attempts: u32,
    },

    /// Any other failure (connection error, unexpected status); never retried
    #[error("Fatal failure for {url}: {reason}")]
    FatalFailure { url: String, reason: String },

    /// Local I/O while streaming a download to disk
    #[error("I/O error during download: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Errors raised while turning a raw record into a segment.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The record is not usable; callers count it and move on
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// JSON syntax error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while reading an input file
    #[error("I/O error while parsing: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a sink. All of them are fatal for the run.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to create output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("GeoPackage error: {0}")]
    GeoPackage(#[from] rusqlite::Error),

    #[error("Shapefile error: {0}")]
    Shapefile(String),

    /// Conflict policy is `fail` and the table is already there
    #[error("Table {schema}.{table} already exists")]
    TableExists { schema: String, table: String },

    #[error("Invalid sink configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink task failed: {0}")]
    Task(String),
}

// ============================================================================
// Tests
// ============================================================================
