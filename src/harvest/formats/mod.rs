//! Sink implementations.
//!
//! Every sink writes the same two layers (segments as LineStrings, places
//! as Points) with the attribute schema declared here, so the column set
//! never drifts between output formats:
//! - `geojson_sink` - raw and filtered GeoJSON FeatureCollections
//! - `geopackage` - one `.gpkg` holding both layers
//! - `shp` - two sibling ESRI Shapefiles
//! - `postgis` - two PostGIS tables with GIST indexes

pub mod geojson_sink;
pub mod geopackage;
pub mod postgis;
pub mod shp;
pub mod wkb;

use std::path::Path;

use crate::config::TableNames;
use crate::model::{Place, RoadSegment};
use crate::traits::FeatureSink;

pub use geojson_sink::GeoJsonSink;
pub use geopackage::GeoPackageSink;
pub use postgis::PostGisSink;
pub use shp::ShapefileSink;

/// Packaged output formats selectable from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExportFormat {
    #[default]
    Gpkg,
    Shp,
    Geojson,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Gpkg => "gpkg",
            ExportFormat::Shp => "shp",
            ExportFormat::Geojson => "geojson",
        }
    }
}

/// Builds the packaged-file sink for `format`.
///
/// Every packaged variant drops segments with fewer than two positions.
pub fn packaged_sink(
    format: ExportFormat,
    output_dir: &Path,
    tables: &TableNames,
) -> Box<dyn FeatureSink> {
    match format {
        ExportFormat::Gpkg => Box::new(GeoPackageSink::new(output_dir, tables.clone())),
        ExportFormat::Shp => Box::new(ShapefileSink::new(output_dir, tables.clone())),
        ExportFormat::Geojson => Box::new(GeoJsonSink::filtered(output_dir, tables.clone())),
    }
}

/// Segments that can be written as LineStrings.
pub fn line_segments(segments: &[RoadSegment]) -> Vec<&RoadSegment> {
    segments.iter().filter(|s| s.has_line_geometry()).collect()
}

/// Places that can be written as Points.
pub fn located_places(places: &[Place]) -> Vec<&Place> {
    places.iter().filter(|p| p.location.is_some()).collect()
}

// ============================================================================
// Attribute schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
}

/// One attribute column.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    /// DBF field names are limited to 10 bytes.
    pub dbf_name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, dbf_name: &'static str, kind: FieldKind) -> Field {
    Field {
        name,
        dbf_name,
        kind,
    }
}

pub const SEGMENT_FIELDS: [Field; 13] = [
    field("segment_id", "segment_id", FieldKind::Integer),
    field("name", "name", FieldKind::Text),
    field("road_type", "road_type", FieldKind::Text),
    field("segment_certainty", "certainty", FieldKind::Text),
    field("construction_period", "constr_per", FieldKind::Text),
    field("itinerary", "itinerary", FieldKind::Text),
    field("author", "author", FieldKind::Text),
    field("bibliography", "biblio", FieldKind::Text),
    field("description", "descr", FieldKind::Text),
    field("length_m", "length_m", FieldKind::Real),
    field("lower_date", "lower_date", FieldKind::Integer),
    field("upper_date", "upper_date", FieldKind::Integer),
    field("source_url", "source_url", FieldKind::Text),
];

pub const PLACE_FIELDS: [Field; 6] = [
    field("pleiades_id", "pleiades", FieldKind::Integer),
    field("name", "name", FieldKind::Text),
    field("place_type", "place_type", FieldKind::Text),
    field("start_year", "start_year", FieldKind::Integer),
    field("end_year", "end_year", FieldKind::Integer),
    field("url", "url", FieldKind::Text),
];

/// A single attribute value, in the same order as its field list.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue<'a> {
    Integer(Option<i64>),
    Real(Option<f64>),
    Text(Option<&'a str>),
}

pub fn segment_values(segment: &RoadSegment) -> [AttrValue<'_>; 13] {
    [
        AttrValue::Integer(Some(segment.segment_id)),
        AttrValue::Text(Some(&segment.name)),
        AttrValue::Text(Some(&segment.road_type)),
        AttrValue::Text(Some(&segment.segment_certainty)),
        AttrValue::Text(segment.construction_period.as_deref()),
        AttrValue::Text(segment.itinerary.as_deref()),
        AttrValue::Text(segment.author.as_deref()),
        AttrValue::Text(segment.bibliography.as_deref()),
        AttrValue::Text(segment.description.as_deref()),
        AttrValue::Real(segment.length_m),
        AttrValue::Integer(segment.lower_date),
        AttrValue::Integer(segment.upper_date),
        AttrValue::Text(Some(&segment.source_url)),
    ]
}

pub fn place_values(place: &Place) -> [AttrValue<'_>; 6] {
    [
        AttrValue::Integer(Some(place.place_id)),
        AttrValue::Text(place.name.as_deref()),
        AttrValue::Text(place.place_type.as_deref()),
        AttrValue::Integer(place.start_year),
        AttrValue::Integer(place.end_year),
        AttrValue::Text(place.url.as_deref()),
    ]
}
