//! Itiner-e record parsing.
//!
//! A record is a GeoJSON-like object: top-level `id`, a `properties` map, a
//! LineString `geometry`, and a `pleiadesPlaces` array of point features.
//! Absent fields never fail a record; only a missing segment id, a
//! non-object record, or unusable coordinates do.

use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::HarvesterConfig;
use crate::harvest::traits::{HarvestStage, ParseError};
use crate::model::{Coord, Place, RoadSegment};

/// Parse warnings logged per input before going quiet.
pub const MAX_PARSE_WARNINGS: usize = 10;

const UNKNOWN: &str = "Unknown";

/// Result of parsing a batch of records.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParseReport {
    pub segments: Vec<RoadSegment>,
    pub failed: usize,
}

impl ParseReport {
    pub fn parsed(&self) -> usize {
        self.segments.len()
    }

    pub fn absorb(&mut self, other: ParseReport) {
        self.segments.extend(other.segments);
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone)]
pub struct RecordParser {
    config: HarvesterConfig,
}

impl RecordParser {
    pub fn new(config: HarvesterConfig) -> Self {
        Self { config }
    }

    /// Parses one JSON document (a single-segment response body).
    pub fn parse_slice(&self, bytes: &[u8]) -> Result<RoadSegment, ParseError> {
        let value: Value = serde_json::from_slice(bytes)?;
        self.parse_value(&value)
    }

    pub fn parse_value(&self, data: &Value) -> Result<RoadSegment, ParseError> {
        let record = data
            .as_object()
            .ok_or_else(|| ParseError::MalformedRecord("record is not a JSON object".into()))?;

        let no_props = Map::new();
        let props = record
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&no_props);

        let segment_id = record
            .get("id")
            .and_then(integer)
            .or_else(|| props.get("_id").and_then(integer))
            .ok_or_else(|| ParseError::MalformedRecord("missing segment id".into()))?;

        let coordinates = line_coordinates(record.get("geometry"))
            .map_err(|reason| ParseError::MalformedRecord(format!("segment {}: {}", segment_id, reason)))?;

        let places = record
            .get("pleiadesPlaces")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_place).collect())
            .unwrap_or_default();

        Ok(RoadSegment {
            segment_id,
            name: text(props, "name").unwrap_or_else(|| UNKNOWN.to_string()),
            road_type: text(props, "type").unwrap_or_else(|| UNKNOWN.to_string()),
            segment_certainty: text(props, "segmentCertainty")
                .unwrap_or_else(|| UNKNOWN.to_string()),
            construction_period: text(props, "constructionPeriod"),
            itinerary: text(props, "itinerary"),
            author: text(props, "author"),
            bibliography: text(props, "bibliography"),
            description: text(props, "description"),
            length_m: props.get("lengthGeo").and_then(float),
            lower_date: props.get("lowerDate").and_then(integer),
            upper_date: props.get("upperDate").and_then(integer),
            source_url: self.config.segment_page_url(segment_id),
            coordinates,
            places,
        })
    }

    /// Parses an NDJSON stream, skipping blank and malformed lines.
    ///
    /// Never fails: a read error ends the stream and counts as one failure.
    pub fn parse_ndjson<R: BufRead>(&self, mut reader: R, source: &str) -> ParseReport {
        let mut report = ParseReport::default();
        let mut line = Vec::new();
        let mut lineno = 0usize;

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(source, line = lineno + 1, error = %e, "Read error, stopping");
                    break;
                }
            }
            lineno += 1;

            let trimmed = trim_whitespace(&line);
            if trimmed.is_empty() {
                continue;
            }

            match self.parse_slice(trimmed) {
                Ok(segment) => report.segments.push(segment),
                Err(e) => {
                    report.failed += 1;
                    if report.failed <= MAX_PARSE_WARNINGS {
                        warn!(source, line = lineno, error = %e, "Parse error");
                    }
                }
            }
        }

        info!(
            source,
            parsed = report.parsed(),
            errors = report.failed,
            "Parsed NDJSON input"
        );
        report
    }

    pub fn parse_ndjson_file(&self, path: &Path) -> Result<ParseReport, ParseError> {
        let file = File::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(self.parse_ndjson(BufReader::new(file), &name))
    }
}

impl HarvestStage for RecordParser {
    type Input = Vec<u8>;
    type Output = RoadSegment;
    type Error = ParseError;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        self.parse_slice(&input)
    }

    fn stage_name(&self) -> &'static str {
        "record_parser"
    }
}

fn parse_place(value: &Value) -> Option<Place> {
    let place = value.as_object()?;
    let Some(place_id) = place.get("id").and_then(integer) else {
        debug!("Dropping place without id");
        return None;
    };

    let no_props = Map::new();
    let props = place
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&no_props);

    let location = place
        .get("geometry")
        .and_then(|g| g.get("coordinates"))
        .and_then(position);

    Some(Place {
        place_id,
        name: text(props, "name"),
        place_type: text(props, "type"),
        start_year: props.get("startYear").and_then(integer),
        end_year: props.get("endYear").and_then(integer),
        url: text(props, "url"),
        location,
    })
}

/// Reads LineString (or flattened MultiLineString) coordinates.
///
/// A missing geometry yields no coordinates; present but unusable
/// coordinates are an error.
fn line_coordinates(geometry: Option<&Value>) -> Result<Vec<Coord>, String> {
    let Some(geometry) = geometry.filter(|g| !g.is_null()) else {
        return Ok(Vec::new());
    };
    let Some(raw) = geometry.get("coordinates").filter(|c| !c.is_null()) else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| "coordinates are not an array".to_string())?;

    let is_multi = geometry.get("type").and_then(Value::as_str) == Some("MultiLineString");
    let mut coords = Vec::new();
    if is_multi {
        for part in items {
            let part = part
                .as_array()
                .ok_or_else(|| "MultiLineString part is not an array".to_string())?;
            for item in part {
                coords.push(position(item).ok_or_else(|| format!("invalid position {}", item))?);
            }
        }
    } else {
        for item in items {
            coords.push(position(item).ok_or_else(|| format!("invalid position {}", item))?);
        }
    }
    Ok(coords)
}

/// `[lon, lat, ...]`; any trailing elevation is ignored.
fn position(value: &Value) -> Option<Coord> {
    let pair = value.as_array()?;
    let lon = pair.first()?.as_f64()?;
    let lat = pair.get(1)?.as_f64()?;
    Some(Coord::new(lon, lat))
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) => &bytes[start..=end],
        _ => &[],
    }
}

fn text(props: &Map<String, Value>, key: &str) -> Option<String> {
    props.get(key).and_then(Value::as_str).map(str::to_string)
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
