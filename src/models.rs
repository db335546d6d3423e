// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::error::SpatialError;
use ahash::AHashMap;
use geo_types::{Coord, Line, Point, Polygon};
use h3o::CellIndex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single attribute carried by a [`GeoPoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

/// A WGS84 point with an open attribute mapping.
///
/// Coordinates are validated at construction and immutable afterwards.
/// Derived ids (cell key, cluster label) are returned by the pipelines as
/// parallel vectors rather than written back into the point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoPoint {
    coord: Point<f64>,
    attributes: AHashMap<String, AttributeValue>,
}

impl GeoPoint {
    /// Builds a point from latitude/longitude in degrees.
    ///
    /// Fails with [`SpatialError::InvalidCoordinate`] if either value is
    /// non-finite or outside the valid WGS84 range.
    pub fn new(lat: f64, lon: f64) -> Result<Self, SpatialError> {
        if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon)
        {
            return Err(SpatialError::InvalidCoordinate { lat, lon });
        }
        Ok(Self {
            coord: Point::new(lon, lat),
            attributes: AHashMap::new(),
        })
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_number(self, key: impl Into<String>, value: f64) -> Self {
        self.with_attr(key, AttributeValue::Number(value))
    }

    pub fn with_text(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_attr(key, AttributeValue::Text(value.into()))
    }

    pub fn lat(&self) -> f64 {
        self.coord.y()
    }

    pub fn lon(&self) -> f64 {
        self.coord.x()
    }

    pub fn point(&self) -> Point<f64> {
        self.coord
    }

    pub fn coord(&self) -> Coord<f64> {
        self.coord.0
    }

    pub fn attr(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn numeric(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key) {
            Some(AttributeValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttributeValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// How a numeric field is reduced per hex cell.
///
/// `Sum` for counts and totals (population), `Mean` for rates and averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reducer {
    Sum,
    Mean,
}

/// Ordinal quantile bucket within a group, inclusive-lower boundary rule:
/// a value equal to a percentile threshold falls into the bucket above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuantileBucket {
    BelowQ25,
    BelowQ50,
    BelowQ75,
    AtOrAboveQ75,
}

impl QuantileBucket {
    pub fn classify(value: f64, q25: f64, q50: f64, q75: f64) -> Self {
        if value < q25 {
            Self::BelowQ25
        } else if value < q50 {
            Self::BelowQ50
        } else if value < q75 {
            Self::BelowQ75
        } else {
            Self::AtOrAboveQ75
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelowQ25 => "<Q25",
            Self::BelowQ50 => "<Q50",
            Self::BelowQ75 => "<Q75",
            Self::AtOrAboveQ75 => ">=Q75",
        }
    }
}

impl fmt::Display for QuantileBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hexagonal cell with its aggregate record.
#[derive(Debug, Clone, Serialize)]
pub struct HexCell {
    pub cell: CellIndex,
    /// Boundary ring in lon/lat order, closed.
    pub boundary: Polygon<f64>,
    /// Number of points aggregated into this cell.
    pub count: usize,
    pub numeric: AHashMap<String, f64>,
    pub categorical: AHashMap<String, String>,
    pub bucket: Option<QuantileBucket>,
}

/// A density cluster with its convex-hull footprint.
///
/// `members` and `nearest_reference` index into the point slices the cluster
/// was built from. Id `-1` (noise) is never materialized as a `Cluster`.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: i32,
    pub members: Vec<usize>,
    pub hull: Polygon<f64>,
    pub centroid: Point<f64>,
    pub nearest_reference: usize,
}

/// A proximity link between an origin and a destination point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub origin: usize,
    pub destination: usize,
    pub distance_km: f64,
    pub geometry: Line<f64>,
}
