//! Proximity spider links between two point sets.
//!
//! Every (origin, destination) pair within the distance threshold becomes a
//! link with a straight-line geometry. Origins with no destination in range
//! are reported rather than silently dropped.

use crate::models::{GeoPoint, Link};
use geo::{Distance, Haversine};
use geo_types::Line;
use rayon::prelude::*;
use tracing::{debug, info};

/// All-pairs link construction under a great-circle distance threshold.
///
/// `max_distance_km` is in kilometres. Returns the qualifying links
/// (origin-major, destination order within an origin) and the indices of
/// unmatched origins in input order. Empty inputs yield empty outputs.
pub fn link(
    origins: &[GeoPoint],
    destinations: &[GeoPoint],
    max_distance_km: f64,
) -> (Vec<Link>, Vec<usize>) {
    let per_origin: Vec<Vec<Link>> = origins
        .par_iter()
        .enumerate()
        .map(|(origin_index, origin)| {
            destinations
                .iter()
                .enumerate()
                .filter_map(|(destination_index, destination)| {
                    let distance_km =
                        Haversine.distance(origin.point(), destination.point()) / 1000.0;
                    (distance_km <= max_distance_km).then(|| Link {
                        origin: origin_index,
                        destination: destination_index,
                        distance_km,
                        geometry: Line::new(origin.coord(), destination.coord()),
                    })
                })
                .collect()
        })
        .collect();

    let mut links = Vec::new();
    let mut unmatched = Vec::new();
    for (origin_index, mut origin_links) in per_origin.into_iter().enumerate() {
        if origin_links.is_empty() {
            debug!("no destination within {max_distance_km} km of origin {origin_index}");
            unmatched.push(origin_index);
        } else {
            links.append(&mut origin_links);
        }
    }

    info!(
        "generated {} spider links, {} unmatched origins",
        links.len(),
        unmatched.len()
    );
    (links, unmatched)
}
