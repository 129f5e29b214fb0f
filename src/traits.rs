use crate::harvest::traits::{FetchError, SinkError};
use crate::model::{Place, RoadSegment};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Returns a short label for logs (e.g. the base URL).
    fn source_id(&self) -> &str;

    /// Fetches the raw JSON body for one segment.
    async fn fetch_segment(&self, segment_id: i64) -> Result<Vec<u8>, FetchError>;

    /// Streams the bulk NDJSON export into `dest`, returning the byte count.
    async fn download_bulk(&self, dest: &Path) -> Result<u64, FetchError>;
}

/// A destination for aggregated segments and places.
#[async_trait]
pub trait FeatureSink: Send + Sync {
    fn name(&self) -> &str;

    /// Writes one run's output. `places` must already be deduplicated.
    async fn write(
        &self,
        segments: &[RoadSegment],
        places: &[Place],
    ) -> Result<SinkReport, SinkError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub sink: String,
    pub segments_written: usize,
    pub places_written: usize,
    /// Files or tables that now hold the output.
    pub targets: Vec<String>,
}
