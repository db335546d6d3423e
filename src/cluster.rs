//! Density-based clustering of a point set with convex-hull footprints.
//!
//! Labels follow DBSCAN semantics: a point belongs to a cluster if it is a
//! core point (at least `min_samples` neighbours within `eps_distance`,
//! itself included) or density-reachable from one; everything else is noise.
//! Cluster membership is a function of the point set alone, so it is stable
//! under input permutation even though label numbering is not.

use crate::error::SpatialError;
use crate::models::{Cluster, GeoPoint};
use geo::{Centroid, ConvexHull, Distance, Haversine};
use geo_types::{MultiPoint, Point};
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

/// Reserved label for unclustered points. Never materialized as a [`Cluster`].
pub const NOISE: i32 = -1;

const UNCLASSIFIED: i32 = -2;

#[derive(Debug, Clone)]
struct IndexedPoint {
    index: usize,
    position: [f64; 2],
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Runs DBSCAN over the points in degree space.
///
/// `eps_distance` is in coordinate units (degrees); callers convert physical
/// distances upstream. Returns a label per point, parallel to the input,
/// with [`NOISE`] for unclustered points. An input smaller than
/// `min_samples` comes back all-noise.
pub fn cluster(points: &[GeoPoint], eps_distance: f64, min_samples: usize) -> Vec<i32> {
    let mut labels = vec![UNCLASSIFIED; points.len()];
    if points.is_empty() {
        return labels;
    }

    let positions: Vec<[f64; 2]> = points.iter().map(|p| [p.lon(), p.lat()]).collect();
    let tree = RTree::bulk_load(
        positions
            .iter()
            .enumerate()
            .map(|(index, &position)| IndexedPoint { index, position })
            .collect(),
    );
    let eps_sq = eps_distance * eps_distance;

    let mut next_cluster = 0;
    for i in 0..points.len() {
        if labels[i] != UNCLASSIFIED {
            continue;
        }
        let seed_neighbours = region_query(&tree, positions[i], eps_sq);
        if seed_neighbours.len() < min_samples {
            labels[i] = NOISE;
            continue;
        }

        labels[i] = next_cluster;
        let mut queue: VecDeque<usize> = seed_neighbours.into_iter().filter(|&j| j != i).collect();
        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                // Border point: density-reachable but not core, absorbed
                // without expansion.
                labels[j] = next_cluster;
                continue;
            }
            if labels[j] != UNCLASSIFIED {
                continue;
            }
            labels[j] = next_cluster;
            let neighbours = region_query(&tree, positions[j], eps_sq);
            if neighbours.len() >= min_samples {
                queue.extend(
                    neighbours
                        .into_iter()
                        .filter(|&k| labels[k] == UNCLASSIFIED || labels[k] == NOISE),
                );
            }
        }
        next_cluster += 1;
    }
    labels
}

fn region_query(tree: &RTree<IndexedPoint>, position: [f64; 2], eps_sq: f64) -> Vec<usize> {
    tree.locate_within_distance(position, eps_sq)
        .map(|neighbour| neighbour.index)
        .collect()
}

/// Materializes clusters from a labeling, resolving each to its nearest
/// reference point.
///
/// Clusters with fewer than 3 members cannot form a hull and are dropped
/// with a warning. Fails with [`SpatialError::EmptyReferenceSet`] only if a
/// cluster survives while `reference_points` is empty. Output is sorted by
/// ascending cluster id.
pub fn build_clusters(
    points: &[GeoPoint],
    labels: &[i32],
    reference_points: &[GeoPoint],
) -> Result<Vec<Cluster>, SpatialError> {
    debug_assert_eq!(points.len(), labels.len());

    let mut members_by_id: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        if label == NOISE {
            continue;
        }
        members_by_id.entry(label).or_default().push(index);
    }

    let mut clusters = Vec::new();
    for (id, members) in members_by_id {
        if members.len() < 3 {
            warn!(
                "skipping cluster {id}: only {} members, cannot form a convex hull",
                members.len()
            );
            continue;
        }
        if reference_points.is_empty() {
            return Err(SpatialError::EmptyReferenceSet);
        }

        let hull = MultiPoint::new(members.iter().map(|&m| points[m].point()).collect())
            .convex_hull();
        let centroid = hull
            .centroid()
            .unwrap_or_else(|| mean_point(points, &members));
        let nearest_reference = nearest_reference(centroid, reference_points);

        clusters.push(Cluster {
            id,
            members,
            hull,
            centroid,
            nearest_reference,
        });
    }
    Ok(clusters)
}

fn nearest_reference(centroid: Point<f64>, reference_points: &[GeoPoint]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (index, reference) in reference_points.iter().enumerate() {
        let distance = Haversine.distance(centroid, reference.point());
        if distance < best_distance {
            best_distance = distance;
            best = index;
        }
    }
    best
}

fn mean_point(points: &[GeoPoint], members: &[usize]) -> Point<f64> {
    let count = members.len() as f64;
    let (sum_x, sum_y) = members.iter().fold((0.0, 0.0), |acc, &m| {
        (acc.0 + points[m].lon(), acc.1 + points[m].lat())
    });
    Point::new(sum_x / count, sum_y / count)
}
