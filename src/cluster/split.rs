use geo::MultiPolygon;
use tracing::info;

use super::aggregate::recompute;
use crate::db::ClusterTx;
use crate::error::ClusterError;
use crate::geometry::{self, BoundingBox};

/// Result of a committed split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    pub new_id: i64,
    /// `None` when the side ended up with no geotagged files.
    pub source_bounds: Option<BoundingBox>,
    pub new_bounds: Option<BoundingBox>,
}

/// Move the files of `source_id` that fall inside `polygon` (boundary
/// included) onto a freshly allocated cluster carrying a copy of the source's
/// metadata.
///
/// Files without a position never match and stay on the source. An empty
/// selection or a selection of every file is valid and leaves one side empty.
pub fn split_in(
    tx: &mut dyn ClusterTx,
    source_id: i64,
    polygon: &MultiPolygon<f64>,
) -> Result<SplitOutcome, ClusterError> {
    let source = tx
        .get_cluster(source_id)?
        .ok_or_else(|| ClusterError::not_found(format!("Cluster {} does not exist", source_id)))?;

    // The clone has to exist before any file can reference it.
    let new_id = tx.next_cluster_id()?;
    tx.insert_cluster(new_id, &source.metadata)?;

    let mut selected = Vec::new();
    for file in tx.files_in_cluster(source_id)? {
        if let Some(point) = file.point()? {
            if geometry::point_in_polygon(&point, polygon) {
                selected.push(file.id);
            }
        }
    }
    let moved = tx.assign_files(&selected, new_id)?;

    let source_aggregates = recompute(tx, source_id)?;
    let new_aggregates = recompute(tx, new_id)?;

    let outcome = SplitOutcome {
        new_id,
        source_bounds: cluster_bounds(tx, source_id)?,
        new_bounds: cluster_bounds(tx, new_id)?,
    };

    info!(
        source_id,
        new_id,
        moved,
        source_nfiles = source_aggregates.file_count,
        new_nfiles = new_aggregates.file_count,
        "Split cluster"
    );
    Ok(outcome)
}

fn cluster_bounds(tx: &mut dyn ClusterTx, cluster_id: i64) -> Result<Option<BoundingBox>, ClusterError> {
    let mut points = Vec::new();
    for file in tx.files_in_cluster(cluster_id)? {
        if let Some(point) = file.point()? {
            points.push(point);
        }
    }
    Ok(geometry::bounding_box(&points))
}
