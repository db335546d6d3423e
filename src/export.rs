//! Flat tabular export of clusters for reuse as a point dataset.

use crate::error::SpatialError;
use crate::models::{AttributeValue, Cluster, GeoPoint};
use csv::WriterBuilder;
use std::io::Write;

/// Writes one CSV row per cluster: id, centroid lat/lon, member count, then
/// the requested attributes of the matched reference point.
///
/// A reference field absent from the matched point is written as an empty
/// column rather than failing the export.
pub fn write_clusters_csv<W: Write>(
    out: W,
    clusters: &[Cluster],
    reference_points: &[GeoPoint],
    reference_fields: &[&str],
) -> Result<(), SpatialError> {
    let mut writer = WriterBuilder::new().from_writer(out);

    let mut header = vec![
        "Cluster_ID".to_string(),
        "Centroid_Lat".to_string(),
        "Centroid_Lon".to_string(),
        "Total_POI".to_string(),
    ];
    header.extend(reference_fields.iter().map(|field| (*field).to_string()));
    writer.write_record(&header)?;

    for cluster in clusters {
        let mut row = vec![
            cluster.id.to_string(),
            cluster.centroid.y().to_string(),
            cluster.centroid.x().to_string(),
            cluster.members.len().to_string(),
        ];
        let reference = &reference_points[cluster.nearest_reference];
        for field in reference_fields {
            row.push(match reference.attr(field) {
                Some(AttributeValue::Text(s)) => s.clone(),
                Some(AttributeValue::Number(n)) => n.to_string(),
                None => String::new(),
            });
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}
