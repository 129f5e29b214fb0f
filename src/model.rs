use serde::{Deserialize, Serialize};

/// A WGS84 position in GeoJSON order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lon: f64,
    pub lat: f64,
}

impl Coord {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn position(&self) -> Vec<f64> {
        vec![self.lon, self.lat]
    }
}

/// One Itiner-e route segment (a LineString feature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadSegment {
    pub segment_id: i64,
    pub name: String,
    pub road_type: String,
    pub segment_certainty: String,
    pub construction_period: Option<String>,
    pub itinerary: Option<String>,
    pub author: Option<String>,
    pub bibliography: Option<String>,
    pub description: Option<String>,
    pub length_m: Option<f64>,
    pub lower_date: Option<i64>, // negative years are BCE
    pub upper_date: Option<i64>,
    pub source_url: String,
    pub coordinates: Vec<Coord>,
    pub places: Vec<Place>,
}

impl RoadSegment {
    /// A segment needs two positions to form a valid LineString.
    pub fn has_line_geometry(&self) -> bool {
        self.coordinates.len() >= 2
    }
}

/// A Pleiades place referenced by one or more segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub place_id: i64,
    pub name: Option<String>,
    pub place_type: Option<String>,
    pub start_year: Option<i64>,
    pub end_year: Option<i64>,
    pub url: Option<String>,
    pub location: Option<Coord>,
}

/// Aggregated output of one run, ready for a sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestBatch {
    pub segments: Vec<RoadSegment>,
    pub places: Vec<Place>,
}

impl HarvestBatch {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
