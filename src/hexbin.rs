// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Hexagonal density grid over a point set.
//!
//! Points are binned into fixed-resolution H3 cells, numeric attributes are
//! reduced per cell (with median imputation of missing samples), cells are
//! filtered through an external suitability classifier, and finally labeled
//! with per-group quantile buckets.

use crate::error::{BoxError, SpatialError};
use crate::models::{AttributeValue, GeoPoint, HexCell, QuantileBucket, Reducer};
use ahash::{AHashMap, AHashSet};
use geo_types::{Coord, LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use itertools::Itertools;
use rayon::prelude::*;
use tracing::warn;

/// External binary suitability predictor.
///
/// Training, feature selection and model lifecycle live with the caller;
/// the aggregation pipeline only consumes `predict`. Errors raised by the
/// implementation are propagated unchanged.
pub trait SuitabilityClassifier {
    fn predict(&self, features: &[f64]) -> Result<u8, BoxError>;
}

impl<F> SuitabilityClassifier for F
where
    F: Fn(&[f64]) -> Result<u8, BoxError>,
{
    fn predict(&self, features: &[f64]) -> Result<u8, BoxError> {
        self(features)
    }
}

/// Computes the H3 cell key for every point at the given resolution.
///
/// The output vector is parallel to `points`. Fails with
/// [`SpatialError::InvalidResolution`] for a resolution outside 0..=15 and
/// [`SpatialError::InvalidCoordinate`] for a point H3 cannot place.
pub fn assign_to_cells(points: &[GeoPoint], resolution: u8) -> Result<Vec<CellIndex>, SpatialError> {
    let resolution =
        Resolution::try_from(resolution).map_err(|_| SpatialError::InvalidResolution(resolution))?;

    points
        .par_iter()
        .map(|point| {
            let latlng = LatLng::new(point.lat(), point.lon()).map_err(|_| {
                SpatialError::InvalidCoordinate {
                    lat: point.lat(),
                    lon: point.lon(),
                }
            })?;
            Ok(latlng.to_cell(resolution))
        })
        .collect()
}

/// The set of cells occupied by at least one of `points` at `resolution`.
///
/// Used to gate one dataset's cells on another's occupancy, e.g. keeping only
/// population cells that also contain a point of interest.
pub fn occupied_cells(
    points: &[GeoPoint],
    resolution: u8,
) -> Result<AHashSet<CellIndex>, SpatialError> {
    Ok(assign_to_cells(points, resolution)?.into_iter().collect())
}

/// Keeps only the (point, cell) pairs whose cell is in `occupied`.
pub fn retain_occupied(
    points: &[GeoPoint],
    cells: &[CellIndex],
    occupied: &AHashSet<CellIndex>,
) -> (Vec<GeoPoint>, Vec<CellIndex>) {
    debug_assert_eq!(points.len(), cells.len());
    points
        .iter()
        .zip(cells.iter())
        .filter(|(_, cell)| occupied.contains(*cell))
        .map(|(point, cell)| (point.clone(), *cell))
        .unzip()
}

/// Groups points by cell key and reduces their attributes into one record
/// per cell.
///
/// Missing numeric values are imputed with the per-field sample median over
/// all points, never treated as zero. Categorical fields take the value of
/// the first point of the group in input order. Output is sorted by cell key.
pub fn aggregate(
    points: &[GeoPoint],
    cells: &[CellIndex],
    numeric_fields: &[(&str, Reducer)],
    categorical_fields: &[&str],
) -> Vec<HexCell> {
    debug_assert_eq!(points.len(), cells.len());

    // Per-field imputation medians, computed over the full sample before
    // any grouping.
    let mut medians: AHashMap<&str, f64> = AHashMap::new();
    for (field, _) in numeric_fields {
        let mut samples: Vec<f64> = points.iter().filter_map(|p| p.numeric(field)).collect();
        match median(&mut samples) {
            Some(m) => {
                medians.insert(*field, m);
            }
            None => warn!("field '{field}' has no numeric samples, omitting from aggregates"),
        }
    }

    let mut groups: AHashMap<CellIndex, Vec<usize>> = AHashMap::new();
    for (index, &cell) in cells.iter().enumerate() {
        groups.entry(cell).or_default().push(index);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (cell, members) in groups.into_iter().sorted_by_key(|(cell, _)| *cell) {
        let mut numeric = AHashMap::new();
        for (field, reducer) in numeric_fields {
            let Some(&fill) = medians.get(field) else {
                continue;
            };
            let sum: f64 = members
                .iter()
                .map(|&m| points[m].numeric(field).unwrap_or(fill))
                .sum();
            let value = match reducer {
                Reducer::Sum => sum,
                Reducer::Mean => sum / members.len() as f64,
            };
            numeric.insert((*field).to_string(), value);
        }

        let mut categorical = AHashMap::new();
        for field in categorical_fields {
            if let Some(value) = members.iter().find_map(|&m| categorical_of(&points[m], field)) {
                categorical.insert((*field).to_string(), value);
            }
        }

        out.push(HexCell {
            cell,
            boundary: cell_boundary(cell),
            count: members.len(),
            numeric,
            categorical,
            bucket: None,
        });
    }
    out
}

/// Retains only the cells the classifier predicts positive.
///
/// The feature vector is assembled in the caller-declared field order; a
/// field absent from a cell's aggregates is a caller contract violation and
/// fails with [`SpatialError::MissingField`]. Classifier errors abort the
/// call and are passed through unchanged.
pub fn filter_by_classifier<C>(
    cells: Vec<HexCell>,
    feature_fields: &[&str],
    classifier: &C,
) -> Result<Vec<HexCell>, SpatialError>
where
    C: SuitabilityClassifier + ?Sized,
{
    let mut kept = Vec::with_capacity(cells.len());
    for cell in cells {
        let mut features = Vec::with_capacity(feature_fields.len());
        for field in feature_fields {
            let value = cell
                .numeric
                .get(*field)
                .copied()
                .ok_or_else(|| SpatialError::MissingField((*field).to_string()))?;
            features.push(value);
        }
        let label = classifier
            .predict(&features)
            .map_err(SpatialError::Classifier)?;
        if label == 1 {
            kept.push(cell);
        }
    }
    Ok(kept)
}

/// Labels every cell with its quantile bucket relative to the other cells
/// of the same `group_field` group.
///
/// Percentiles use linear interpolation; groups with fewer than 4 cells
/// still compute (degenerate) thresholds. The boundary rule is inclusive
/// lower: a value equal to a threshold lands in the bucket above it.
pub fn bucket_by_quantile(
    mut cells: Vec<HexCell>,
    value_field: &str,
    group_field: &str,
) -> Result<Vec<HexCell>, SpatialError> {
    let mut groups: AHashMap<String, Vec<usize>> = AHashMap::new();
    for (index, cell) in cells.iter().enumerate() {
        let group = cell
            .categorical
            .get(group_field)
            .ok_or_else(|| SpatialError::MissingField(group_field.to_string()))?;
        groups.entry(group.clone()).or_default().push(index);
    }

    for member_indices in groups.into_values() {
        let mut values = Vec::with_capacity(member_indices.len());
        for &index in &member_indices {
            values.push(
                cells[index]
                    .numeric
                    .get(value_field)
                    .copied()
                    .ok_or_else(|| SpatialError::MissingField(value_field.to_string()))?,
            );
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let q25 = percentile(&values, 25.0);
        let q50 = percentile(&values, 50.0);
        let q75 = percentile(&values, 75.0);

        for &index in &member_indices {
            let value = cells[index].numeric[value_field];
            cells[index].bucket = Some(QuantileBucket::classify(value, q25, q50, q75));
        }
    }
    Ok(cells)
}

/// Boundary polygon for a cell key, ring in lon/lat order, closed.
///
/// Pure derivation: the same key always yields the same polygon.
pub fn cell_boundary(cell: CellIndex) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = cell
        .boundary()
        .iter()
        .map(|vertex| Coord {
            x: vertex.lng(),
            y: vertex.lat(),
        })
        .collect();
    Polygon::new(LineString::new(ring), vec![])
}

fn categorical_of(point: &GeoPoint, field: &str) -> Option<String> {
    match point.attr(field)? {
        AttributeValue::Text(s) => Some(s.clone()),
        AttributeValue::Number(n) => Some(n.to_string()),
    }
}

fn median(samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let mid = samples.len() / 2;
    Some(if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    })
}

// Linear-interpolation percentile over an ascending slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use h3o::Resolution;

    fn point(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon).unwrap()
    }

    fn cell_at(lat: f64, lon: f64, resolution: Resolution) -> CellIndex {
        LatLng::new(lat, lon).unwrap().to_cell(resolution)
    }

    fn cell_with(group: &str, value: f64) -> HexCell {
        let cell = cell_at(3.139, 101.6869, Resolution::Seven);
        let mut numeric = AHashMap::new();
        numeric.insert("population".to_string(), value);
        let mut categorical = AHashMap::new();
        categorical.insert("parlimen".to_string(), group.to_string());
        HexCell {
            cell,
            boundary: cell_boundary(cell),
            count: 1,
            numeric,
            categorical,
            bucket: None,
        }
    }

    #[test]
    fn test_finer_resolution_never_merges() {
        let points = vec![
            point(3.10, 101.60),
            point(3.15, 101.65),
            point(3.20, 101.70),
            point(5.41, 100.33),
            point(1.49, 103.74),
        ];
        let coarse: AHashSet<CellIndex> =
            assign_to_cells(&points, 5).unwrap().into_iter().collect();
        let fine: AHashSet<CellIndex> = assign_to_cells(&points, 8).unwrap().into_iter().collect();
        assert!(fine.len() >= coarse.len());
    }

    #[test]
    fn test_invalid_resolution() {
        let points = vec![point(3.1, 101.6)];
        assert!(matches!(
            assign_to_cells(&points, 16),
            Err(SpatialError::InvalidResolution(16))
        ));
    }

    #[test]
    fn test_empty_input_yields_empty_cells() {
        let cells = assign_to_cells(&[], 7).unwrap();
        assert!(cells.is_empty());
        let aggregated = aggregate(&[], &cells, &[("population", Reducer::Sum)], &["parlimen"]);
        assert!(aggregated.is_empty());
    }

    #[test]
    fn test_aggregate_sum_mean_and_first() {
        // Two co-located points share a hex, one point far away.
        let points = vec![
            point(3.1000, 101.6000)
                .with_number("population", 100.0)
                .with_number("income_avg", 4000.0)
                .with_text("parlimen", "P114"),
            point(3.1000, 101.6000)
                .with_number("population", 50.0)
                .with_number("income_avg", 6000.0)
                .with_text("parlimen", "P999"),
            point(5.4100, 100.3300)
                .with_number("population", 10.0)
                .with_number("income_avg", 3000.0)
                .with_text("parlimen", "P045"),
        ];
        let cells = assign_to_cells(&points, 7).unwrap();
        assert_eq!(cells[0], cells[1]);
        assert_ne!(cells[0], cells[2]);

        let aggregated = aggregate(
            &points,
            &cells,
            &[("population", Reducer::Sum), ("income_avg", Reducer::Mean)],
            &["parlimen"],
        );
        assert_eq!(aggregated.len(), 2);

        let shared = aggregated.iter().find(|c| c.count == 2).unwrap();
        assert_eq!(shared.numeric["population"], 150.0);
        assert_eq!(shared.numeric["income_avg"], 5000.0);
        // First point in input order wins the categorical slot.
        assert_eq!(shared.categorical["parlimen"], "P114");
    }

    #[test]
    fn test_aggregate_order_independence() {
        let mut points = vec![
            point(3.1000, 101.6000).with_number("population", 10.5),
            point(3.1001, 101.6001).with_number("population", 20.25),
            point(3.1002, 101.6000).with_number("population", 30.125),
        ];
        let cells = assign_to_cells(&points, 7).unwrap();
        let forward = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);

        points.reverse();
        let cells = assign_to_cells(&points, 7).unwrap();
        let reversed = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);

        assert_eq!(forward.len(), reversed.len());
        for (a, b) in forward.iter().zip(reversed.iter()) {
            assert_eq!(a.cell, b.cell);
            assert!((a.numeric["population"] - b.numeric["population"]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_median_imputation_not_zero_fill() {
        // Third point has no population sample; the median of [10, 30] = 20
        // must be imputed, so the cell sums to 60, not 40.
        let points = vec![
            point(3.1000, 101.6000).with_number("population", 10.0),
            point(3.1000, 101.6000).with_number("population", 30.0),
            point(3.1000, 101.6000),
        ];
        let cells = assign_to_cells(&points, 7).unwrap();
        let aggregated = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].numeric["population"], 60.0);
    }

    #[test]
    fn test_field_without_any_samples_is_omitted() {
        let points = vec![point(3.1, 101.6).with_number("population", 5.0)];
        let cells = assign_to_cells(&points, 7).unwrap();
        let aggregated = aggregate(
            &points,
            &cells,
            &[("population", Reducer::Sum), ("income_avg", Reducer::Mean)],
            &[],
        );
        assert!(aggregated[0].numeric.contains_key("population"));
        assert!(!aggregated[0].numeric.contains_key("income_avg"));
    }

    #[test]
    fn test_occupancy_gating() {
        let population = vec![
            point(3.1000, 101.6000).with_number("population", 10.0),
            point(5.4100, 100.3300).with_number("population", 20.0),
        ];
        let pois = vec![point(3.1000, 101.6000)];

        let cells = assign_to_cells(&population, 7).unwrap();
        let occupied = occupied_cells(&pois, 7).unwrap();
        let (kept_points, kept_cells) = retain_occupied(&population, &cells, &occupied);

        assert_eq!(kept_points.len(), 1);
        assert_eq!(kept_cells.len(), 1);
        assert_eq!(kept_points[0].lat(), 3.1000);
    }

    #[test]
    fn test_classifier_filter() {
        let points = vec![
            point(3.1000, 101.6000).with_number("population", 500.0),
            point(5.4100, 100.3300).with_number("population", 5.0),
        ];
        let cells = assign_to_cells(&points, 7).unwrap();
        let aggregated = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);
        assert_eq!(aggregated.len(), 2);

        let model = |features: &[f64]| -> Result<u8, BoxError> {
            Ok(u8::from(features[0] >= 100.0))
        };
        let kept = filter_by_classifier(aggregated, &["population"], &model).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].numeric["population"], 500.0);
    }

    #[test]
    fn test_classifier_error_propagates() {
        let points = vec![point(3.1, 101.6).with_number("population", 1.0)];
        let cells = assign_to_cells(&points, 7).unwrap();
        let aggregated = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);

        let broken =
            |_: &[f64]| -> Result<u8, BoxError> { Err("model not fitted".into()) };
        assert!(matches!(
            filter_by_classifier(aggregated, &["population"], &broken),
            Err(SpatialError::Classifier(_))
        ));
    }

    #[test]
    fn test_classifier_missing_feature_field() {
        let points = vec![point(3.1, 101.6).with_number("population", 1.0)];
        let cells = assign_to_cells(&points, 7).unwrap();
        let aggregated = aggregate(&points, &cells, &[("population", Reducer::Sum)], &[]);

        let model = |_: &[f64]| -> Result<u8, BoxError> { Ok(1) };
        assert!(matches!(
            filter_by_classifier(aggregated, &["income_avg"], &model),
            Err(SpatialError::MissingField(_))
        ));
    }

    #[test]
    fn test_quantile_fixture() {
        // [10, 20, 30, 40] -> Q25 = 17.5, Q50 = 25, Q75 = 32.5.
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 25.0), 17.5);
        assert_eq!(percentile(&values, 50.0), 25.0);
        assert_eq!(percentile(&values, 75.0), 32.5);

        // Equality goes to the bucket above (inclusive-lower rule).
        assert_eq!(
            QuantileBucket::classify(25.0, 17.5, 25.0, 32.5),
            QuantileBucket::BelowQ75
        );
        assert_eq!(
            QuantileBucket::classify(17.5, 17.5, 25.0, 32.5),
            QuantileBucket::BelowQ50
        );
    }

    #[test]
    fn test_bucket_by_quantile() {
        let cells = vec![
            cell_with("X", 10.0),
            cell_with("X", 20.0),
            cell_with("X", 30.0),
            cell_with("X", 40.0),
        ];
        let bucketed = bucket_by_quantile(cells, "population", "parlimen").unwrap();
        let buckets: Vec<QuantileBucket> = bucketed.iter().map(|c| c.bucket.unwrap()).collect();
        assert_eq!(
            buckets,
            vec![
                QuantileBucket::BelowQ25,
                QuantileBucket::BelowQ50,
                QuantileBucket::BelowQ75,
                QuantileBucket::AtOrAboveQ75,
            ]
        );
    }

    #[test]
    fn test_bucketing_is_monotonic() {
        let values = [3.0, 1.0, 4.0, 1.5, 9.0, 2.6, 5.3];
        let cells: Vec<HexCell> = values.iter().map(|&v| cell_with("X", v)).collect();
        let bucketed = bucket_by_quantile(cells, "population", "parlimen").unwrap();

        let mut pairs: Vec<(f64, QuantileBucket)> = bucketed
            .iter()
            .map(|c| (c.numeric["population"], c.bucket.unwrap()))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for window in pairs.windows(2) {
            assert!(window[0].1 <= window[1].1);
        }
    }

    #[test]
    fn test_tiny_group_still_buckets() {
        let cells = vec![cell_with("X", 42.0)];
        let bucketed = bucket_by_quantile(cells, "population", "parlimen").unwrap();
        assert_eq!(bucketed[0].bucket, Some(QuantileBucket::AtOrAboveQ75));
    }

    #[test]
    fn test_bucket_missing_group_field() {
        let mut cell = cell_with("X", 1.0);
        cell.categorical.clear();
        assert!(matches!(
            bucket_by_quantile(vec![cell], "population", "parlimen"),
            Err(SpatialError::MissingField(_))
        ));
    }

    #[test]
    fn test_boundary_is_closed_and_stable() {
        let cell = cell_at(3.139, 101.6869, Resolution::Seven);
        let first = cell_boundary(cell);
        let second = cell_boundary(cell);
        assert_eq!(first, second);

        let exterior: Vec<_> = first.exterior().points().collect();
        assert_eq!(exterior.first(), exterior.last());
        // Hexagon (or pentagon at the twelve distortion vertices).
        assert!(exterior.len() >= 6);
    }
}
