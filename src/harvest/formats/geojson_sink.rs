use async_trait::async_trait;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde_json::json;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{place_values, segment_values, AttrValue, Field, PLACE_FIELDS, SEGMENT_FIELDS};
use crate::config::TableNames;
use crate::harvest::traits::SinkError;
use crate::model::{Place, RoadSegment};
use crate::traits::{FeatureSink, SinkReport};

/// Writes segments and places as two GeoJSON FeatureCollections.
///
/// The raw variant keeps segments with fewer than two positions (their
/// LineString is written as-is); the filtered variant drops them like the
/// other packaged formats do.
#[derive(Debug, Clone)]
pub struct GeoJsonSink {
    output_dir: PathBuf,
    tables: TableNames,
    include_degenerate: bool,
}

impl GeoJsonSink {
    pub fn raw(output_dir: &Path, tables: TableNames) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            tables,
            include_degenerate: true,
        }
    }

    pub fn filtered(output_dir: &Path, tables: TableNames) -> Self {
        Self {
            include_degenerate: false,
            ..Self::raw(output_dir, tables)
        }
    }

    pub fn segments_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.geojson", self.tables.segments))
    }

    pub fn places_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.geojson", self.tables.places))
    }

    fn build(&self, segments: &[RoadSegment], places: &[Place]) -> (FeatureCollection, FeatureCollection) {
        let lines = segments
            .iter()
            .filter(|s| self.include_degenerate || s.has_line_geometry())
            .map(|s| {
                let positions = s.coordinates.iter().map(|c| c.position()).collect();
                feature(
                    Value::LineString(positions),
                    properties(&SEGMENT_FIELDS, &segment_values(s)),
                )
            })
            .collect();

        let points = places
            .iter()
            .filter_map(|p| {
                let location = p.location?;
                Some(feature(
                    Value::Point(location.position()),
                    properties(&PLACE_FIELDS, &place_values(p)),
                ))
            })
            .collect();

        (collection(lines), collection(points))
    }
}

#[async_trait]
impl FeatureSink for GeoJsonSink {
    fn name(&self) -> &str {
        if self.include_degenerate {
            "geojson"
        } else {
            "geojson-filtered"
        }
    }

    async fn write(
        &self,
        segments: &[RoadSegment],
        places: &[Place],
    ) -> Result<SinkReport, SinkError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let (lines, points) = self.build(segments, places);

        let segments_path = self.segments_path();
        let places_path = self.places_path();
        let segments_written = lines.features.len();
        let places_written = points.features.len();

        let (lines_target, points_target) = (segments_path.clone(), places_path.clone());
        tokio::task::spawn_blocking(move || -> Result<(), SinkError> {
            write_collection(&lines_target, &lines)?;
            write_collection(&points_target, &points)
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))??;

        info!(count = segments_written, path = %segments_path.display(), "Saved line features");
        info!(count = places_written, path = %places_path.display(), "Saved point features");

        Ok(SinkReport {
            sink: self.name().to_string(),
            segments_written,
            places_written,
            targets: vec![
                segments_path.display().to_string(),
                places_path.display().to_string(),
            ],
        })
    }
}

fn feature(value: Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn properties(fields: &[Field], values: &[AttrValue<'_>]) -> JsonObject {
    fields
        .iter()
        .zip(values)
        .map(|(field, value)| {
            let json = match value {
                AttrValue::Integer(v) => json!(v),
                AttrValue::Real(v) => json!(v),
                AttrValue::Text(v) => json!(v),
            };
            (field.name.to_string(), json)
        })
        .collect()
}

fn write_collection(path: &Path, collection: &FeatureCollection) -> Result<(), SinkError> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer(&mut writer, collection)?;
    writer.flush()?;
    Ok(())
}
