//! Harvest pipeline coordinator.
//!
//! [`HarvestPipeline`] drives one run through the state machine
//! `Idle → Fetching → Parsing → Aggregating → Writing → Done`, with
//! `Failed` reachable from `Fetching` and `Writing`. Stages run one after
//! another:
//! - Fetching via a [`SegmentSource`] (bulk download or per-id batch) or
//!   by listing local NDJSON files
//! - Parsing on the blocking pool via `tokio::task::spawn_blocking`
//! - Aggregation of places
//! - Writing to every configured [`FeatureSink`] in order, each write
//!   bounded by the stage timeout
//!
//! Input files are opened while fetching, so parsing only ever counts bad
//! records and cannot fail the run.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::executor::BatchExecutor;
use crate::harvest::aggregate::Aggregator;
use crate::harvest::parser::{ParseReport, RecordParser, MAX_PARSE_WARNINGS};
use crate::harvest::traits::{FetchError, HarvestStage, SinkError};
use crate::model::HarvestBatch;
use crate::traits::{FeatureSink, SegmentSource, SinkReport};

// ============================================================================
// Pipeline Types
// ============================================================================

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Parsing,
    Aggregating,
    Writing,
    Done,
    Failed,
}

/// What a run should harvest.
#[derive(Debug, Clone)]
pub enum HarvestRequest {
    /// Download the bulk NDJSON export to `dest`, then parse it
    Bulk { dest: PathBuf },

    /// Fetch these segment ids one by one
    Segments(Vec<i64>),

    /// Parse an NDJSON file, or every `*.ndjson` file in a directory
    LocalFiles(PathBuf),
}

/// Complete harvest result with the aggregated batch and statistics.
#[derive(Debug)]
pub struct HarvestResult {
    pub batch: HarvestBatch,

    /// One report per sink that ran, in sink order
    pub reports: Vec<SinkReport>,

    pub stats: HarvestStats,
}

/// Statistics about one run.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    pub total_duration_ms: u64,
    pub fetch_duration_ms: u64,
    pub parse_duration_ms: u64,
    pub write_duration_ms: u64,

    /// Segment ids requested (segments mode only)
    pub requested: usize,
    pub not_found: usize,
    pub fetch_failed: usize,

    /// Bytes written by a bulk download
    pub bytes_downloaded: u64,

    pub files_read: usize,
    pub parsed: usize,
    pub parse_failed: usize,
    pub places: usize,
}

// ============================================================================
// Pipeline Errors
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Local input harvest produced no usable records
    #[error("No segments found in {input}")]
    EmptyResult { input: String },

    #[error("Sink '{sink}' failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("Stage task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Pipeline Executor
// ============================================================================

struct SinkSlot {
    sink: Box<dyn FeatureSink>,
    /// Skip this sink when the run produced no segments
    requires_data: bool,
}

/// Sequential harvest pipeline.
///
/// # Example
///
/// ```ignore
/// let client = ItinereClient::new(config.clone())?;
/// let mut pipeline = HarvestPipeline::new(client, RecordParser::new(config.clone()))
///     .with_request_delay(config.request_delay)
///     .with_sink(Box::new(GeoJsonSink::raw(&output, config.tables.clone())));
///
/// let result = pipeline.run(HarvestRequest::Segments(vec![31702, 31703])).await?;
/// println!("{} segments", result.stats.parsed);
/// ```
pub struct HarvestPipeline<S>
where
    S: SegmentSource,
{
    source: S,
    parser: RecordParser,
    sinks: Vec<SinkSlot>,

    /// Delay between single-segment requests (default: 500ms)
    request_delay: Duration,

    /// Timeout for each sink write (default: 5 minutes)
    stage_timeout: Duration,

    state: RunState,

    /// Stage the last failed run was in
    failed_in: Option<RunState>,
}

impl<S> HarvestPipeline<S>
where
    S: SegmentSource,
{
    pub fn new(source: S, parser: RecordParser) -> Self {
        Self {
            source,
            parser,
            sinks: Vec::new(),
            request_delay: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(300),
            state: RunState::Idle,
            failed_in: None,
        }
    }

    /// Adds a sink that always runs, even for an empty batch.
    pub fn with_sink(mut self, sink: Box<dyn FeatureSink>) -> Self {
        self.sinks.push(SinkSlot {
            sink,
            requires_data: false,
        });
        self
    }

    /// Adds a sink that is skipped when no segments were harvested.
    pub fn with_sink_if_nonempty(mut self, sink: Box<dyn FeatureSink>) -> Self {
        self.sinks.push(SinkSlot {
            sink,
            requires_data: true,
        });
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Sets the timeout applied to each sink write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The stage a failed run stopped in; `None` after a successful run.
    pub fn failed_in(&self) -> Option<RunState> {
        self.failed_in
    }

    fn transition(&mut self, next: RunState) {
        info!(from = ?self.state, to = ?next, "Pipeline state");
        self.state = next;
    }

    /// Runs one harvest to completion.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if:
    /// - the bulk download fails or an input file cannot be opened
    /// - a local-file run yields zero segments (`EmptyResult`)
    /// - any sink fails or exceeds the stage timeout
    ///
    /// Per-segment fetch failures and malformed records are counted in
    /// [`HarvestStats`] and never abort the run.
    pub async fn run(&mut self, request: HarvestRequest) -> Result<HarvestResult, PipelineError> {
        self.state = RunState::Idle;
        self.failed_in = None;
        match self.run_stages(request).await {
            Ok(result) => {
                self.transition(RunState::Done);
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, state = ?self.state, "Harvest failed");
                self.failed_in = Some(self.state);
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, request: HarvestRequest) -> Result<HarvestResult, PipelineError> {
        let start = Instant::now();
        let mut stats = HarvestStats::default();

        // ====================================================================
        // Stage 1: Fetching
        // ====================================================================

        self.transition(RunState::Fetching);
        let fetch_start = Instant::now();

        let input = match &request {
            HarvestRequest::Bulk { dest } => {
                stats.bytes_downloaded = self.source.download_bulk(dest).await?;
                stats.files_read = 1;
                Input::Files(open_inputs(vec![dest.clone()])?)
            }
            HarvestRequest::Segments(ids) => {
                let batch = BatchExecutor::new(self.request_delay)
                    .fetch_all(&self.source, ids)
                    .await;
                stats.requested = batch.requested;
                stats.not_found = batch.not_found;
                stats.fetch_failed = batch.failed;
                Input::Payloads(batch.payloads)
            }
            HarvestRequest::LocalFiles(path) => {
                let files = ndjson_inputs(path)?;
                stats.files_read = files.len();
                Input::Files(open_inputs(files)?)
            }
        };

        stats.fetch_duration_ms = fetch_start.elapsed().as_millis() as u64;
        info!(duration_ms = stats.fetch_duration_ms, "Fetching completed");

        // ====================================================================
        // Stage 2: Parsing
        // ====================================================================

        self.transition(RunState::Parsing);
        let parse_start = Instant::now();

        let parser = self.parser.clone();
        let report = tokio::task::spawn_blocking(move || parse_input(&parser, input))
            .await
            .map_err(|e| PipelineError::Task(format!("Task join error: {}", e)))?;

        stats.parsed = report.parsed();
        stats.parse_failed = report.failed;
        stats.parse_duration_ms = parse_start.elapsed().as_millis() as u64;
        info!(
            duration_ms = stats.parse_duration_ms,
            parsed = stats.parsed,
            failed = stats.parse_failed,
            "Parsing completed"
        );

        // ====================================================================
        // Stage 3: Aggregating
        // ====================================================================

        self.transition(RunState::Aggregating);
        let batch = match Aggregator.execute(report.segments) {
            Ok(batch) => batch,
            Err(never) => match never {},
        };
        stats.places = batch.places.len();
        info!(
            segments = batch.segments.len(),
            places = stats.places,
            "Aggregation completed"
        );

        // ====================================================================
        // Stage 4: Writing
        // ====================================================================

        self.transition(RunState::Writing);
        let write_start = Instant::now();

        // A local-file run with nothing usable has nothing to write
        if let HarvestRequest::LocalFiles(path) = &request {
            if batch.is_empty() {
                return Err(PipelineError::EmptyResult {
                    input: path.display().to_string(),
                });
            }
        }
        let mut reports = Vec::with_capacity(self.sinks.len());

        for slot in &self.sinks {
            if slot.requires_data && batch.is_empty() {
                info!(sink = slot.sink.name(), "No segments harvested, skipping sink");
                continue;
            }
            let report = timeout(
                self.stage_timeout,
                slot.sink.write(&batch.segments, &batch.places),
            )
            .await
            .map_err(|_| PipelineError::StageTimeout {
                stage: slot.sink.name().to_string(),
                timeout_secs: self.stage_timeout.as_secs(),
            })?
            .map_err(|source| PipelineError::Sink {
                sink: slot.sink.name().to_string(),
                source,
            })?;
            info!(
                sink = %report.sink,
                segments = report.segments_written,
                places = report.places_written,
                "Sink finished"
            );
            reports.push(report);
        }

        stats.write_duration_ms = write_start.elapsed().as_millis() as u64;
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        Ok(HarvestResult {
            batch,
            reports,
            stats,
        })
    }
}

/// Raw material handed from the fetch stage to the parse stage.
enum Input {
    /// Already-opened NDJSON files with their display names
    Files(Vec<(String, File)>),
    Payloads(Vec<(i64, Vec<u8>)>),
}

fn open_inputs(paths: Vec<PathBuf>) -> Result<Vec<(String, File)>, std::io::Error> {
    paths
        .into_iter()
        .map(|path| {
            let file = File::open(&path)?;
            Ok((path.display().to_string(), file))
        })
        .collect()
}

fn parse_input(parser: &RecordParser, input: Input) -> ParseReport {
    let mut report = ParseReport::default();
    match input {
        Input::Files(files) => {
            for (name, file) in files {
                report.absorb(parser.parse_ndjson(BufReader::new(file), &name));
            }
        }
        Input::Payloads(payloads) => {
            for (id, body) in payloads {
                match parser.execute(body) {
                    Ok(segment) => report.segments.push(segment),
                    Err(e) => {
                        if report.failed < MAX_PARSE_WARNINGS {
                            warn!(segment_id = id, error = %e, "Skipping unparsable segment");
                        }
                        report.failed += 1;
                    }
                }
            }
        }
    }
    report
}

/// Resolves a local input: a file as-is, a directory as its `*.ndjson`
/// files in name order.
fn ndjson_inputs(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if !path.is_dir() {
        std::fs::metadata(path)?;
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let file = entry?.path();
        if file.is_file() && file.extension().is_some_and(|ext| ext == "ndjson") {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarvesterConfig;
    use crate::model::{Place, RoadSegment};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const RECORD: &str = r#"{"id": 1, "properties": {"name": "Via Appia"},
        "geometry": {"type": "LineString", "coordinates": [[12.5, 41.9], [12.6, 41.8]]},
        "pleiadesPlaces": [{"id": 423025, "geometry": {"coordinates": [12.48, 41.89]}}]}"#;

    struct MockSource {
        bulk_body: String,
    }

    #[async_trait]
    impl SegmentSource for MockSource {
        fn source_id(&self) -> &str {
            "mock"
        }

        async fn fetch_segment(&self, segment_id: i64) -> Result<Vec<u8>, FetchError> {
            match segment_id {
                1 => Ok(RECORD.as_bytes().to_vec()),
                2 => Ok(b"not json".to_vec()),
                _ => Err(FetchError::NotFound {
                    url: format!("mock/{}", segment_id),
                }),
            }
        }

        async fn download_bulk(&self, dest: &Path) -> Result<u64, FetchError> {
            if self.bulk_body.is_empty() {
                return Err(FetchError::FatalFailure {
                    url: "mock/bulk".to_string(),
                    reason: "HTTP 400".to_string(),
                });
            }
            std::fs::write(dest, &self.bulk_body)?;
            Ok(self.bulk_body.len() as u64)
        }
    }

    /// Records what it was asked to write.
    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<(usize, usize)>>>,
        fail: bool,
    }

    #[async_trait]
    impl FeatureSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn write(
            &self,
            segments: &[RoadSegment],
            places: &[Place],
        ) -> Result<SinkReport, SinkError> {
            if self.fail {
                return Err(SinkError::Task("boom".to_string()));
            }
            self.writes
                .lock()
                .unwrap()
                .push((segments.len(), places.len()));
            Ok(SinkReport {
                sink: "recording".to_string(),
                segments_written: segments.len(),
                places_written: places.len(),
                targets: vec![],
            })
        }
    }

    fn pipeline(bulk_body: &str) -> HarvestPipeline<MockSource> {
        HarvestPipeline::new(
            MockSource {
                bulk_body: bulk_body.to_string(),
            },
            RecordParser::new(HarvesterConfig::default()),
        )
        .with_request_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_segments_run() {
        let sink = RecordingSink::default();
        let mut pipeline = pipeline("").with_sink(Box::new(sink.clone()));

        let result = pipeline
            .run(HarvestRequest::Segments(vec![1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(pipeline.state(), RunState::Done);
        assert_eq!(result.stats.requested, 3);
        assert_eq!(result.stats.not_found, 1);
        assert_eq!(result.stats.parsed, 1);
        assert_eq!(result.stats.parse_failed, 1);
        assert_eq!(result.batch.places.len(), 1);
        assert_eq!(*sink.writes.lock().unwrap(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn test_bulk_run_parses_downloaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{}\n\n{}\n", RECORD.replace('\n', " "), "{broken");
        let mut pipeline = pipeline(&body);

        let result = pipeline
            .run(HarvestRequest::Bulk {
                dest: dir.path().join("all.ndjson"),
            })
            .await
            .unwrap();

        assert_eq!(result.stats.bytes_downloaded, body.len() as u64);
        assert_eq!(result.stats.parsed, 1);
        assert_eq!(result.stats.parse_failed, 1);
    }

    #[tokio::test]
    async fn test_bulk_failure_moves_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline("");

        let err = pipeline
            .run(HarvestRequest::Bulk {
                dest: dir.path().join("all.ndjson"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Fetch(_)));
        assert_eq!(pipeline.state(), RunState::Failed);
        assert_eq!(pipeline.failed_in(), Some(RunState::Fetching));
    }

    #[tokio::test]
    async fn test_local_files_reads_directory_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let line = RECORD.replace('\n', " ");
        std::fs::write(dir.path().join("b.ndjson"), format!("{}\n", line.replace("\"id\": 1", "\"id\": 2"))).unwrap();
        std::fs::write(dir.path().join("a.ndjson"), format!("{}\n", line)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut pipeline = pipeline("");
        let result = pipeline
            .run(HarvestRequest::LocalFiles(dir.path().to_path_buf()))
            .await
            .unwrap();

        assert_eq!(result.stats.files_read, 2);
        let ids: Vec<i64> = result.batch.segments.iter().map(|s| s.segment_id).collect();
        assert_eq!(ids, vec![1, 2]);
        // Both segments link the same place
        assert_eq!(result.batch.places.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_local_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.ndjson"), "\n\n").unwrap();
        let sink = RecordingSink::default();
        let mut pipeline = pipeline("").with_sink(Box::new(sink.clone()));

        let err = pipeline
            .run(HarvestRequest::LocalFiles(dir.path().to_path_buf()))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::EmptyResult { .. }));
        assert_eq!(pipeline.failed_in(), Some(RunState::Writing));
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_input_never_fails_while_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let line = RECORD.replace('\n', " ");
        let mut body = String::new();
        for i in 0..20_000 {
            body.push_str(&line);
            body.push('\n');
            if i % 1000 == 0 {
                body.push_str("{not json\n");
            }
        }
        std::fs::write(dir.path().join("big.ndjson"), body).unwrap();

        let mut pipeline = pipeline("").with_timeout(Duration::from_millis(1));
        let result = pipeline
            .run(HarvestRequest::LocalFiles(dir.path().to_path_buf()))
            .await
            .unwrap();

        assert_eq!(pipeline.state(), RunState::Done);
        assert_eq!(pipeline.failed_in(), None);
        assert_eq!(result.stats.parsed, 20_000);
        assert_eq!(result.stats.parse_failed, 20);
    }

    #[tokio::test]
    async fn test_missing_local_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline("");

        let err = pipeline
            .run(HarvestRequest::LocalFiles(dir.path().join("missing.ndjson")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[tokio::test]
    async fn test_nonempty_only_sink_is_skipped_for_empty_batch() {
        let always = RecordingSink::default();
        let gated = RecordingSink::default();
        let mut pipeline = pipeline("")
            .with_sink(Box::new(always.clone()))
            .with_sink_if_nonempty(Box::new(gated.clone()));

        let result = pipeline.run(HarvestRequest::Segments(vec![99])).await.unwrap();

        assert_eq!(result.reports.len(), 1);
        assert_eq!(*always.writes.lock().unwrap(), vec![(0, 0)]);
        assert!(gated.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let failing = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let mut pipeline = pipeline("").with_sink(Box::new(failing));

        let err = pipeline.run(HarvestRequest::Segments(vec![1])).await.unwrap_err();

        assert!(matches!(err, PipelineError::Sink { .. }));
        assert_eq!(pipeline.state(), RunState::Failed);
        assert_eq!(pipeline.failed_in(), Some(RunState::Writing));
    }

    struct StalledSink;

    #[async_trait]
    impl FeatureSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn write(
            &self,
            _segments: &[RoadSegment],
            _places: &[Place],
        ) -> Result<SinkReport, SinkError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SinkReport::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_times_out_in_writing() {
        let mut pipeline = pipeline("")
            .with_timeout(Duration::from_secs(5))
            .with_sink(Box::new(StalledSink));

        let err = pipeline.run(HarvestRequest::Segments(vec![1])).await.unwrap_err();

        match err {
            PipelineError::StageTimeout { stage, timeout_secs } => {
                assert_eq!(stage, "stalled");
                assert_eq!(timeout_secs, 5);
            }
            other => panic!("expected StageTimeout, got {:?}", other),
        }
        assert_eq!(pipeline.failed_in(), Some(RunState::Writing));
    }
}
