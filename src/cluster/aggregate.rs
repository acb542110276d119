//! Derived cluster fields.
//!
//! [`recompute`] is the only writer of `nfiles`, `min_datetime`,
//! `max_datetime`, the `datetime` label and the centroid. It always derives
//! from the member files as they are now, never from the previous values, so
//! running it twice changes nothing the second time.

use crate::db::{Aggregates, ClusterTx, FileRecord};
use crate::error::ClusterError;

/// Minute-resolution label shown for a cluster, e.g. `202406181405`.
pub const LABEL_FORMAT: &str = "%Y%m%d%H%M";

impl Aggregates {
    /// Files without a capture time count towards `file_count` but not the
    /// time range; files without a position do not move the centroid.
    pub fn from_files(files: &[FileRecord]) -> Self {
        let timestamps = files.iter().filter_map(|f| f.captured_at);
        let min_timestamp = timestamps.clone().min();
        let max_timestamp = timestamps.max();

        let positions: Vec<(f64, f64)> = files
            .iter()
            .filter_map(|f| f.point().ok().flatten())
            .map(|p| (p.x(), p.y()))
            .collect();
        let centroid = if positions.is_empty() {
            None
        } else {
            let n = positions.len() as f64;
            let (sum_lon, sum_lat) = positions
                .iter()
                .fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            Some((sum_lon / n, sum_lat / n))
        };

        Aggregates {
            file_count: files.len() as i64,
            min_timestamp,
            max_timestamp,
            label: min_timestamp.map(|t| t.format(LABEL_FORMAT).to_string()),
            centroid,
        }
    }
}

/// Recompute and store the derived fields of `cluster_id` inside the caller's
/// transaction.
pub fn recompute(tx: &mut dyn ClusterTx, cluster_id: i64) -> Result<Aggregates, ClusterError> {
    let files = tx.files_in_cluster(cluster_id)?;
    let aggregates = Aggregates::from_files(&files);

    if tx.write_aggregates(cluster_id, &aggregates)? == 0 {
        return Err(ClusterError::not_found(format!(
            "Cluster {} does not exist",
            cluster_id
        )));
    }

    tracing::debug!(
        cluster_id,
        nfiles = aggregates.file_count,
        label = ?aggregates.label,
        "Recomputed cluster aggregates"
    );
    Ok(aggregates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;

    #[test]
    fn test_nulls_counted_but_not_ranged() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 5, "Fjord");
        add_file(&db, Some(5), "a.jpg", Some((10.0, 60.0)), Some("2024-06-18T14:05:09"));
        add_file(&db, Some(5), "b.jpg", Some((10.2, 60.2)), Some("2024-06-18T15:30:00"));
        add_file(&db, Some(5), "c.jpg", None, None);

        let agg = db.run_atomic(|tx| recompute(tx, 5)).unwrap();
        assert_eq!(agg.file_count, 3);
        assert_eq!(agg.min_timestamp, Some(ts("2024-06-18T14:05:09")));
        assert_eq!(agg.max_timestamp, Some(ts("2024-06-18T15:30:00")));
        assert_eq!(agg.label.as_deref(), Some("202406181405"));
        let (lon, lat) = agg.centroid.unwrap();
        assert!((lon - 10.1).abs() < 1e-9);
        assert!((lat - 60.1).abs() < 1e-9);

        let stored = db.run_atomic(|tx| tx.get_cluster(5)).unwrap().unwrap();
        assert_eq!(stored.aggregates, agg);
    }

    #[test]
    fn test_empty_cluster() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 2, "Empty");

        let agg = db.run_atomic(|tx| recompute(tx, 2)).unwrap();
        assert_eq!(agg, Aggregates::default());
    }

    #[test]
    fn test_idempotent() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");
        add_file(&db, Some(1), "a.jpg", Some((10.0, 60.0)), Some("2024-06-18T09:00:00"));
        add_file(&db, Some(1), "b.jpg", Some((10.0, 60.1)), None);

        let first = db.run_atomic(|tx| recompute(tx, 1)).unwrap();
        let second = db.run_atomic(|tx| recompute(tx, 1)).unwrap();
        assert_eq!(first, second);

        let stored = db.run_atomic(|tx| tx.get_cluster(1)).unwrap().unwrap();
        assert_eq!(stored.aggregates, second);
    }

    #[test]
    fn test_missing_cluster_is_not_found() {
        let (_dir, db) = open_temp();
        let err = db.run_atomic(|tx| recompute(tx, 77)).unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
