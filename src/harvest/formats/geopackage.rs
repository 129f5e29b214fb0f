//! Minimal OGC GeoPackage (1.3) writer.
//!
//! Produces one SQLite file with the mandatory metadata tables, the WGS 84
//! spatial reference, and one feature table per layer. Geometries are
//! stored as GeoPackage binary blobs (`GP` header + little-endian WKB).

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{
    line_segments, place_values, segment_values, wkb, AttrValue, Field, FieldKind, PLACE_FIELDS,
    SEGMENT_FIELDS,
};
use crate::config::{TableNames, WGS84_SRID};
use crate::harvest::traits::SinkError;
use crate::model::{Coord, Place, RoadSegment};
use crate::traits::{FeatureSink, SinkReport};

/// `GPKG` in ASCII.
const APPLICATION_ID: i32 = 0x4750_4B47;
const USER_VERSION: i32 = 10300;

const WGS84_DEFINITION: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const METADATA_DDL: &str = r#"
CREATE TABLE gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL PRIMARY KEY,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE gpkg_contents (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
INSERT INTO gpkg_spatial_ref_sys VALUES
    ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', 'undefined cartesian coordinate reference system'),
    ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', 'undefined geographic coordinate reference system');
"#;

/// Writes both layers into `<segments table>.gpkg`.
#[derive(Debug, Clone)]
pub struct GeoPackageSink {
    output_dir: PathBuf,
    tables: TableNames,
}

impl GeoPackageSink {
    pub fn new(output_dir: &Path, tables: TableNames) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            tables,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.gpkg", self.tables.segments))
    }
}

#[async_trait]
impl FeatureSink for GeoPackageSink {
    fn name(&self) -> &str {
        "gpkg"
    }

    async fn write(
        &self,
        segments: &[RoadSegment],
        places: &[Place],
    ) -> Result<SinkReport, SinkError> {
        self.tables.validate()?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let path = self.path();
        let tables = self.tables.clone();
        let lines: Vec<RoadSegment> = line_segments(segments).into_iter().cloned().collect();
        let points: Vec<Place> = places.iter().filter(|p| p.location.is_some()).cloned().collect();

        let target = path.clone();
        let (segments_written, places_written) = tokio::task::spawn_blocking(move || {
            write_geopackage(&target, &tables, &lines, &points)
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))??;

        info!(
            lines = segments_written,
            points = places_written,
            path = %path.display(),
            "Exported GeoPackage"
        );

        Ok(SinkReport {
            sink: self.name().to_string(),
            segments_written,
            places_written,
            targets: vec![
                format!("{}#{}", path.display(), self.tables.segments),
                format!("{}#{}", path.display(), self.tables.places),
            ],
        })
    }
}

/// Recreates the file from scratch and writes both layers in one transaction.
pub fn write_geopackage(
    path: &Path,
    tables: &TableNames,
    segments: &[RoadSegment],
    places: &[Place],
) -> Result<(usize, usize), SinkError> {
    if path.exists() {
        debug!(path = %path.display(), "Replacing existing GeoPackage");
        std::fs::remove_file(path)?;
    }

    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "application_id", APPLICATION_ID)?;
    conn.pragma_update(None, "user_version", USER_VERSION)?;

    let tx = conn.transaction()?;
    tx.execute_batch(METADATA_DDL)?;
    tx.execute(
        "INSERT INTO gpkg_spatial_ref_sys VALUES ('WGS 84 geodetic', ?1, 'EPSG', ?1, ?2, 'longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid')",
        params![WGS84_SRID, WGS84_DEFINITION],
    )?;

    create_layer(&tx, &tables.segments, "LINESTRING", &SEGMENT_FIELDS)?;
    create_layer(&tx, &tables.places, "POINT", &PLACE_FIELDS)?;

    {
        let mut insert = tx.prepare(&insert_sql(&tables.segments, &SEGMENT_FIELDS))?;
        for segment in segments {
            let mut row = vec![SqlValue::Blob(gpkg_geometry(
                wkb::linestring(&segment.coordinates),
                &segment.coordinates,
            ))];
            row.extend(segment_values(segment).iter().map(sql_value));
            insert.execute(params_from_iter(row))?;
        }

        let mut insert = tx.prepare(&insert_sql(&tables.places, &PLACE_FIELDS))?;
        for place in places {
            let Some(location) = place.location else {
                continue;
            };
            let mut row = vec![SqlValue::Blob(gpkg_geometry(wkb::point(location), &[]))];
            row.extend(place_values(place).iter().map(sql_value));
            insert.execute(params_from_iter(row))?;
        }
    }

    let line_extent = wkb::envelope(segments.iter().flat_map(|s| s.coordinates.iter()));
    let point_extent = wkb::envelope(places.iter().filter_map(|p| p.location.as_ref()));
    update_extent(&tx, &tables.segments, line_extent)?;
    update_extent(&tx, &tables.places, point_extent)?;

    tx.commit()?;
    Ok((segments.len(), places.iter().filter(|p| p.location.is_some()).count()))
}

fn create_layer(
    conn: &Connection,
    table: &str,
    geometry_type: &str,
    fields: &[Field],
) -> Result<(), SinkError> {
    let columns: Vec<String> = fields
        .iter()
        .map(|f| {
            let sql_type = match f.kind {
                FieldKind::Integer => "INTEGER",
                FieldKind::Real => "REAL",
                FieldKind::Text => "TEXT",
            };
            format!("\"{}\" {}", f.name, sql_type)
        })
        .collect();

    conn.execute_batch(&format!(
        "CREATE TABLE \"{table}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, geom {geometry_type}, {columns});",
        table = table,
        geometry_type = geometry_type,
        columns = columns.join(", "),
    ))?;
    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) VALUES (?1, 'features', ?1, ?2)",
        params![table, WGS84_SRID],
    )?;
    conn.execute(
        "INSERT INTO gpkg_geometry_columns VALUES (?1, 'geom', ?2, ?3, 0, 0)",
        params![table, geometry_type, WGS84_SRID],
    )?;
    Ok(())
}

fn insert_sql(table: &str, fields: &[Field]) -> String {
    let names: Vec<String> = fields.iter().map(|f| format!("\"{}\"", f.name)).collect();
    let placeholders: Vec<String> = (1..=fields.len() + 1).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO \"{}\" (geom, {}) VALUES ({})",
        table,
        names.join(", "),
        placeholders.join(", ")
    )
}

fn update_extent(
    conn: &Connection,
    table: &str,
    extent: Option<(f64, f64, f64, f64)>,
) -> Result<(), SinkError> {
    if let Some((min_x, min_y, max_x, max_y)) = extent {
        conn.execute(
            "UPDATE gpkg_contents SET min_x = ?2, min_y = ?3, max_x = ?4, max_y = ?5 WHERE table_name = ?1",
            params![table, min_x, min_y, max_x, max_y],
        )?;
    }
    Ok(())
}

fn sql_value(value: &AttrValue<'_>) -> SqlValue {
    match value {
        AttrValue::Integer(Some(v)) => SqlValue::Integer(*v),
        AttrValue::Real(Some(v)) => SqlValue::Real(*v),
        AttrValue::Text(Some(v)) => SqlValue::Text(v.to_string()),
        _ => SqlValue::Null,
    }
}

/// GeoPackage binary: magic, version, flags, srs id, optional XY envelope, WKB.
///
/// An empty `envelope_coords` omits the envelope (used for points).
fn gpkg_geometry(wkb: Vec<u8>, envelope_coords: &[Coord]) -> Vec<u8> {
    let envelope = wkb::envelope(envelope_coords);
    // bit 0: little-endian header; bits 1-3: envelope type (1 = XY)
    let flags: u8 = if envelope.is_some() { 0b0000_0011 } else { 0b0000_0001 };

    let mut blob = Vec::with_capacity(8 + 32 + wkb.len());
    blob.extend_from_slice(b"GP");
    blob.push(0);
    blob.push(flags);
    blob.extend_from_slice(&WGS84_SRID.to_le_bytes());
    if let Some((min_x, min_y, max_x, max_y)) = envelope {
        for v in [min_x, max_x, min_y, max_y] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
    }
    blob.extend_from_slice(&wkb);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, place, segment};

    #[tokio::test]
    async fn test_geopackage_layers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = GeoPackageSink::new(dir.path(), TableNames::default());
        let segments = vec![
            segment(1, line(&[(12.0, 41.0), (12.5, 41.5)]), vec![]),
            segment(2, line(&[(13.0, 42.0)]), vec![]),
        ];
        let places = vec![place(100, 12.1, 41.1), place(101, 12.2, 41.2)];

        let report = sink.write(&segments, &places).await.unwrap();
        assert_eq!(report.segments_written, 1);
        assert_eq!(report.places_written, 2);

        let conn = Connection::open(sink.path()).unwrap();
        let app_id: i32 = conn
            .query_row("PRAGMA application_id", [], |r| r.get(0))
            .unwrap();
        assert_eq!(app_id, APPLICATION_ID);

        let layers: Vec<String> = conn
            .prepare("SELECT table_name FROM gpkg_contents ORDER BY table_name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(layers, vec!["roman_road_places", "roman_road_segments"]);

        let (count, blob): (i64, Vec<u8>) = conn
            .query_row(
                "SELECT count(*), max(geom) FROM roman_road_segments",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(&blob[0..2], b"GP");
        assert_eq!(blob[3], 0b0000_0011);

        let min_x: f64 = conn
            .query_row(
                "SELECT min_x FROM gpkg_contents WHERE table_name = 'roman_road_segments'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(min_x, 12.0);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = GeoPackageSink::new(dir.path(), TableNames::default());
        let segments = vec![segment(1, line(&[(0.0, 0.0), (1.0, 1.0)]), vec![])];

        sink.write(&segments, &[]).await.unwrap();
        sink.write(&segments, &[]).await.unwrap();

        let conn = Connection::open(sink.path()).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM roman_road_segments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_point_blob_has_no_envelope() {
        let blob = gpkg_geometry(wkb::point(Coord::new(1.0, 2.0)), &[]);
        assert_eq!(blob[3], 0b0000_0001);
        assert_eq!(blob.len(), 8 + 21);
    }
}
