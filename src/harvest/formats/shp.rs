use ::shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use ::shapefile::{Point, Polyline, Writer};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{line_segments, place_values, segment_values, AttrValue, Field, FieldKind, PLACE_FIELDS, SEGMENT_FIELDS};
use crate::config::TableNames;
use crate::harvest::traits::SinkError;
use crate::model::{Place, RoadSegment};
use crate::traits::{FeatureSink, SinkReport};

const ESRI_WGS84: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

/// Longest value a DBF character field can hold.
const MAX_CHARACTER_LEN: usize = 254;

/// Writes two sibling shapefiles (`.shp`, `.shx`, `.dbf`, `.prj` each).
#[derive(Debug, Clone)]
pub struct ShapefileSink {
    output_dir: PathBuf,
    tables: TableNames,
}

impl ShapefileSink {
    pub fn new(output_dir: &Path, tables: TableNames) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            tables,
        }
    }

    pub fn segments_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.shp", self.tables.segments))
    }

    pub fn places_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.shp", self.tables.places))
    }
}

#[async_trait]
impl FeatureSink for ShapefileSink {
    fn name(&self) -> &str {
        "shp"
    }

    async fn write(
        &self,
        segments: &[RoadSegment],
        places: &[Place],
    ) -> Result<SinkReport, SinkError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let lines: Vec<RoadSegment> = line_segments(segments).into_iter().cloned().collect();
        let points: Vec<Place> = places.iter().filter(|p| p.location.is_some()).cloned().collect();
        let (segments_path, places_path) = (self.segments_path(), self.places_path());

        let (lines_target, points_target) = (segments_path.clone(), places_path.clone());
        let (segments_written, places_written) = tokio::task::spawn_blocking(move || {
            let written_lines = write_lines(&lines_target, &lines)?;
            let written_points = write_points(&points_target, &points)?;
            Ok::<_, SinkError>((written_lines, written_points))
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))??;

        info!(count = segments_written, path = %segments_path.display(), "Exported lines");
        info!(count = places_written, path = %places_path.display(), "Exported points");

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

fn write_lines(path: &Path, segments: &[RoadSegment]) -> Result<usize, SinkError> {
    let mut writer = Writer::from_path(path, table_builder(&SEGMENT_FIELDS)?).map_err(shp_error)?;
    for segment in segments {
        let points = segment
            .coordinates
            .iter()
            .map(|c| Point::new(c.lon, c.lat))
            .collect();
        let record = record(&SEGMENT_FIELDS, &segment_values(segment));
        writer
            .write_shape_and_record(&Polyline::new(points), &record)
            .map_err(shp_error)?;
    }
    drop(writer);
    write_prj(path)?;
    Ok(segments.len())
}

fn write_points(path: &Path, places: &[Place]) -> Result<usize, SinkError> {
    let mut writer = Writer::from_path(path, table_builder(&PLACE_FIELDS)?).map_err(shp_error)?;
    let mut written = 0;
    for place in places {
        let Some(location) = place.location else {
            continue;
        };
        let record = record(&PLACE_FIELDS, &place_values(place));
        writer
            .write_shape_and_record(&Point::new(location.lon, location.lat), &record)
            .map_err(shp_error)?;
        written += 1;
    }
    drop(writer);
    write_prj(path)?;
    Ok(written)
}

fn table_builder(fields: &[Field]) -> Result<TableWriterBuilder, SinkError> {
    let mut builder = TableWriterBuilder::new();
    for field in fields {
        let name = FieldName::try_from(field.dbf_name)
            .map_err(|e| SinkError::Shapefile(format!("field {}: {:?}", field.dbf_name, e)))?;
        builder = match field.kind {
            FieldKind::Integer => builder.add_numeric_field(name, 18, 0),
            FieldKind::Real => builder.add_numeric_field(name, 19, 6),
            FieldKind::Text => builder.add_character_field(name, MAX_CHARACTER_LEN as u8),
        };
    }
    Ok(builder)
}

fn record(fields: &[Field], values: &[AttrValue<'_>]) -> Record {
    let mut record = Record::default();
    for (field, value) in fields.iter().zip(values) {
        let value = match value {
            AttrValue::Integer(v) => FieldValue::Numeric(v.map(|v| v as f64)),
            AttrValue::Real(v) => FieldValue::Numeric(*v),
            AttrValue::Text(v) => FieldValue::Character(v.map(|s| truncate(s, MAX_CHARACTER_LEN).to_string())),
        };
        record.insert(field.dbf_name.to_string(), value);
    }
    record
}

/// Cuts `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_prj(shp_path: &Path) -> Result<(), SinkError> {
    std::fs::write(shp_path.with_extension("prj"), ESRI_WGS84)?;
    Ok(())
}

fn shp_error(e: ::shapefile::Error) -> SinkError {
    SinkError::Shapefile(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, place, segment};

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
        // 'é' is two bytes; cutting inside it backs off
        assert_eq!(truncate("aé", 2), "a");
    }

    #[tokio::test]
    async fn test_writes_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ShapefileSink::new(dir.path(), TableNames::default());
        let segments = vec![
            segment(1, line(&[(12.0, 41.0), (12.5, 41.5)]), vec![]),
            segment(2, line(&[(13.0, 42.0)]), vec![]),
        ];
        let places = vec![place(100, 12.1, 41.1)];

        let report = sink.write(&segments, &places).await.unwrap();
        assert_eq!(report.segments_written, 1);
        assert_eq!(report.places_written, 1);

        for table in ["roman_road_segments", "roman_road_places"] {
            for ext in ["shp", "shx", "dbf", "prj"] {
                let path = dir.path().join(format!("{}.{}", table, ext));
                assert!(path.exists(), "missing {}", path.display());
            }
        }
    }
}
