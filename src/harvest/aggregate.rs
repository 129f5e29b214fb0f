//! Merges parsed segments into one [`HarvestBatch`].

use std::collections::HashSet;
use std::convert::Infallible;
use tracing::debug;

use crate::harvest::traits::HarvestStage;
use crate::model::{HarvestBatch, Place, RoadSegment};

/// Collects the places of every segment, keeping the first occurrence of
/// each Pleiades id and dropping places without coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    pub fn dedup_places(segments: &[RoadSegment]) -> Vec<Place> {
        let mut seen = HashSet::new();
        let mut places = Vec::new();
        let mut duplicates = 0usize;

        for place in segments.iter().flat_map(|s| s.places.iter()) {
            if place.location.is_none() {
                continue;
            }
            if seen.insert(place.place_id) {
                places.push(place.clone());
            } else {
                duplicates += 1;
            }
        }

        debug!(unique = places.len(), duplicates, "Deduplicated places");
        places
    }
}

impl HarvestStage for Aggregator {
    type Input = Vec<RoadSegment>;
    type Output = HarvestBatch;
    type Error = Infallible;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        let places = Self::dedup_places(&input);
        Ok(HarvestBatch {
            segments: input,
            places,
        })
    }

    fn stage_name(&self) -> &'static str {
        "aggregator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, segment};
    use crate::model::Coord;

    fn place(id: i64, lon: f64) -> Place {
        crate::model::fixtures::place(id, lon, 40.0)
    }

    fn seg(id: i64, places: Vec<Place>) -> RoadSegment {
        segment(id, line(&[(0.0, 0.0), (1.0, 1.0)]), places)
    }

    #[test]
    fn test_first_occurrence_wins() {
        let segments = vec![
            seg(1, vec![place(10, 1.0), place(11, 2.0)]),
            seg(2, vec![place(10, 99.0), place(12, 3.0)]),
            seg(3, vec![place(10, 50.0)]),
        ];

        let batch = Aggregator.execute(segments.clone()).unwrap();

        assert_eq!(batch.segments, segments);
        let ids: Vec<i64> = batch.places.iter().map(|p| p.place_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert_eq!(batch.places[0].location, Some(Coord::new(1.0, 40.0)));
    }

    #[test]
    fn test_places_without_location_are_dropped() {
        let mut unlocated = place(20, 0.0);
        unlocated.location = None;
        // A located duplicate after an unlocated one is still kept.
        let segments = vec![seg(1, vec![unlocated]), seg(2, vec![place(20, 5.0)])];

        let places = Aggregator::dedup_places(&segments);
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].location, Some(Coord::new(5.0, 40.0)));
    }

    #[test]
    fn test_empty_input() {
        let batch = Aggregator.execute(Vec::new()).unwrap();
        assert!(batch.is_empty());
        assert!(batch.places.is_empty());
    }
}
