//! PostGIS sink tests
//!
//! These need a PostGIS-enabled database and only run when
//! `ROMAN_ROADS_TEST_DATABASE_URL` is set; otherwise they return early.

use roman_roads_harvester::config::{ConflictPolicy, DatabaseConfig, TableNames};
use roman_roads_harvester::harvest::{PostGisSink, SinkError};
use roman_roads_harvester::model::{Coord, Place, RoadSegment};
use roman_roads_harvester::FeatureSink;

fn database_url() -> Option<String> {
    std::env::var("ROMAN_ROADS_TEST_DATABASE_URL").ok()
}

fn tables(suffix: &str) -> TableNames {
    TableNames {
        segments: format!("rr_test_segments_{}", suffix),
        places: format!("rr_test_places_{}", suffix),
    }
}

fn sample() -> (Vec<RoadSegment>, Vec<Place>) {
    let place = Place {
        place_id: 423025,
        name: Some("Roma".to_string()),
        place_type: Some("settlement".to_string()),
        start_year: Some(-750),
        end_year: None,
        url: None,
        location: Some(Coord::new(12.48, 41.89)),
    };
    let segment = |id: i64, coordinates: Vec<Coord>| RoadSegment {
        segment_id: id,
        name: format!("Segment {}", id),
        road_type: "Main Road".to_string(),
        segment_certainty: "Certain".to_string(),
        construction_period: None,
        itinerary: None,
        author: None,
        bibliography: None,
        description: Some("O'Brien's \"quoted\" road".to_string()),
        length_m: Some(1000.0),
        lower_date: Some(-312),
        upper_date: None,
        source_url: format!("https://www.itiner-e.org/route-segment/{}", id),
        coordinates,
        places: vec![place.clone()],
    };
    let segments = vec![
        segment(1, vec![Coord::new(12.5, 41.9), Coord::new(12.6, 41.8)]),
        segment(2, vec![Coord::new(12.6, 41.8), Coord::new(12.7, 41.7)]),
        segment(3, vec![Coord::new(12.7, 41.7)]),
    ];
    (segments, vec![place])
}

#[tokio::test]
async fn test_replace_is_idempotent() {
    let Some(url) = database_url() else {
        return;
    };
    let sink = PostGisSink::new(DatabaseConfig::new(url), tables("replace"));
    let (segments, places) = sample();

    let first = sink.write(&segments, &places).await.unwrap();
    let counts_first = sink.table_counts().await.unwrap();
    let second = sink.write(&segments, &places).await.unwrap();
    let counts_second = sink.table_counts().await.unwrap();

    // The single-point segment is excluded
    assert_eq!(first.segments_written, 2);
    assert_eq!(first, second);
    assert_eq!(counts_first, (2, 1));
    assert_eq!(counts_first, counts_second);
}

#[tokio::test]
async fn test_append_accumulates_rows() {
    let Some(url) = database_url() else {
        return;
    };
    let tables = tables("append");
    let (segments, places) = sample();

    let replace = PostGisSink::new(DatabaseConfig::new(url.clone()), tables.clone());
    replace.write(&segments, &places).await.unwrap();

    let append = PostGisSink::new(
        DatabaseConfig::new(url).with_conflict_policy(ConflictPolicy::Append),
        tables,
    )
    .with_chunk_size(1);
    append.write(&segments, &places).await.unwrap();

    assert_eq!(append.table_counts().await.unwrap(), (4, 2));
}

#[tokio::test]
async fn test_fail_policy_rejects_existing_table() {
    let Some(url) = database_url() else {
        return;
    };
    let tables = tables("fail");
    let (segments, places) = sample();

    PostGisSink::new(DatabaseConfig::new(url.clone()), tables.clone())
        .write(&segments, &places)
        .await
        .unwrap();

    let err = PostGisSink::new(
        DatabaseConfig::new(url).with_conflict_policy(ConflictPolicy::Fail),
        tables,
    )
    .write(&segments, &places)
    .await
    .unwrap_err();

    assert!(matches!(err, SinkError::TableExists { .. }));
}
