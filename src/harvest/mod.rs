//! Harvest module - fetch, parse, aggregate and write road segments.
//!
//! This module provides the building blocks of a harvest run:
//! - **Traits**: [`HarvestStage`] plus the per-stage error types
//! - **Fetch**: [`ItinereClient`], the retrying HTTP source
//! - **Parse**: [`RecordParser`] for single records and NDJSON exports
//! - **Aggregate**: [`Aggregator`] for place deduplication
//! - **Formats**: GeoJSON, GeoPackage, Shapefile and PostGIS sinks
//! - **Pipeline**: the run coordinator via [`pipeline::HarvestPipeline`]

pub mod aggregate;
pub mod fetch;
pub mod formats;
pub mod parser;
pub mod pipeline;
pub mod traits;

// Re-export commonly used types
pub use traits::{FetchError, HarvestStage, ParseError, SinkError};

pub use aggregate::Aggregator;
pub use fetch::ItinereClient;
pub use formats::{
    packaged_sink, ExportFormat, GeoJsonSink, GeoPackageSink, PostGisSink, ShapefileSink,
};
pub use parser::{ParseReport, RecordParser};
pub use pipeline::{
    HarvestPipeline, HarvestRequest, HarvestResult, HarvestStats, PipelineError, RunState,
};
