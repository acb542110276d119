//! Cluster partitioning: merge, split, metadata edits and derived fields.
//!
//! The `*_in` operators work against an open [`ClusterTx`] so they can be
//! composed inside one unit of work; the functions here each run a single
//! operator as its own atomic unit on a [`Database`].
//!
//! [`ClusterTx`]: crate::db::ClusterTx

pub mod aggregate;
pub mod features;
pub mod incremental;
pub mod merge;
pub mod split;
pub mod update;

use serde_json::Value;

use crate::config::ClusteringConfig;
use crate::db::{Aggregates, Database};
use crate::error::ClusterError;
use crate::geometry;

pub use aggregate::recompute;
pub use features::{cluster_features, cluster_points};
pub use incremental::{cluster_unassigned, PassSummary};
pub use merge::merge_in;
pub use split::{split_in, SplitOutcome};
pub use update::{update_in, ClusterPatch};

/// Merge clusters into the smallest id and return it.
pub fn merge(db: &Database, cluster_ids: &[i64]) -> Result<i64, ClusterError> {
    db.run_atomic(|tx| merge_in(tx, cluster_ids))
}

/// Split the files of `source_id` inside a GeoJSON polygon onto a new cluster.
///
/// The polygon is validated before the store is touched.
pub fn split(db: &Database, source_id: i64, polygon: &Value) -> Result<SplitOutcome, ClusterError> {
    let polygon = geometry::polygon_from_geojson(polygon)?;
    db.run_atomic(|tx| split_in(tx, source_id, &polygon))
}

pub fn update(db: &Database, cluster_id: i64, patch: &ClusterPatch) -> Result<(), ClusterError> {
    db.run_atomic(|tx| update_in(tx, cluster_id, patch))
}

pub fn refresh(db: &Database, cluster_id: i64) -> Result<Aggregates, ClusterError> {
    db.run_atomic(|tx| recompute(tx, cluster_id))
}

pub fn clusters_geojson(db: &Database) -> Result<Value, ClusterError> {
    db.run_atomic(|tx| cluster_features(tx))
}

pub fn points_geojson(db: &Database, cluster_id: i64) -> Result<Value, ClusterError> {
    db.run_atomic(|tx| cluster_points(tx, cluster_id))
}

/// One incremental clustering pass over unassigned files.
pub fn run_pass(db: &Database, config: &ClusteringConfig) -> Result<PassSummary, ClusterError> {
    db.run_atomic(|tx| cluster_unassigned(tx, config))
}
