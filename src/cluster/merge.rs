use tracing::info;

use super::aggregate::recompute;
use crate::db::ClusterTx;
use crate::error::ClusterError;

/// Merge `cluster_ids` into the smallest of them and return that id.
///
/// Every file owned by an absorbed cluster moves onto the keep cluster, the
/// absorbed rows are deleted and the keep cluster's aggregates are
/// recomputed. Absorbed ids that no longer exist are skipped, so replaying a
/// merge that already committed only re-asserts the keep cluster.
pub fn merge_in(tx: &mut dyn ClusterTx, cluster_ids: &[i64]) -> Result<i64, ClusterError> {
    let mut ids = cluster_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let Some((&keep_id, absorbed)) = ids.split_first() else {
        return Err(ClusterError::invalid("Need at least two cluster IDs"));
    };
    if absorbed.is_empty() {
        return Err(ClusterError::invalid("Need at least two cluster IDs"));
    }

    if tx.existing_cluster_ids(&[keep_id])?.is_empty() {
        return Err(ClusterError::not_found(format!(
            "Cluster {} does not exist",
            keep_id
        )));
    }

    let moved = tx.reassign_clusters(absorbed, keep_id)?;
    let deleted = tx.delete_clusters(absorbed)?;
    let aggregates = recompute(tx, keep_id)?;

    info!(
        keep_id,
        absorbed = ?absorbed,
        moved,
        deleted,
        nfiles = aggregates.file_count,
        "Merged clusters"
    );
    Ok(keep_id)
}
