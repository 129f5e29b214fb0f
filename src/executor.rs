use crate::harvest::traits::FetchError;
use crate::traits::SegmentSource;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Raw payloads and counters from one batch of single-segment fetches.
#[derive(Debug, Default)]
pub struct FetchBatch {
    /// `(segment_id, body)` in request order
    pub payloads: Vec<(i64, Vec<u8>)>,
    pub requested: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Runs single-segment fetches one after another with a polite delay.
///
/// The delay is applied between requests only, never after the last one,
/// so `n` requests sleep `n - 1` times.
pub struct BatchExecutor {
    delay: Duration,
}

impl BatchExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    #[instrument(skip(self, source, ids), fields(source = source.source_id(), count = ids.len()))]
    pub async fn fetch_all<S>(&self, source: &S, ids: &[i64]) -> FetchBatch
    where
        S: SegmentSource + ?Sized,
    {
        let mut batch = FetchBatch {
            requested: ids.len(),
            ..FetchBatch::default()
        };

        for (i, &id) in ids.iter().enumerate() {
            match source.fetch_segment(id).await {
                Ok(body) => {
                    debug!(segment_id = id, bytes = body.len(), "Fetched segment");
                    batch.payloads.push((id, body));
                }
                Err(FetchError::NotFound { .. }) => {
                    debug!(segment_id = id, "Segment not found, skipping");
                    batch.not_found += 1;
                }
                Err(e) => {
                    warn!(segment_id = id, error = %e, "Failed to fetch segment");
                    batch.failed += 1;
                }
            }

            if (i + 1) % 50 == 0 {
                info!(done = i + 1, total = ids.len(), "Fetch progress");
            }

            if i + 1 < ids.len() && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        info!(
            fetched = batch.payloads.len(),
            not_found = batch.not_found,
            failed = batch.failed,
            "Batch fetch finished"
        );
        batch
    }
}
