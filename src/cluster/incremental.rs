//! Background clustering of newly ingested files.
//!
//! A pass assigns every unclustered file that has a position and a capture
//! time to the nearest open cluster close enough in both time and space,
//! opening new clusters where nothing fits, then merges open clusters whose
//! files overlap. Clusters flagged `readyforsigma` are never touched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::NaiveDateTime;
use geo::Point;
use tracing::{debug, info, warn};

use super::aggregate::recompute;
use super::merge::merge_in;
use crate::config::ClusteringConfig;
use crate::db::{ClusterMetadata, ClusterTx};
use crate::error::ClusterError;
use crate::geometry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub files_assigned: usize,
    pub clusters_created: Vec<i64>,
    /// Keep id of every overlap merge.
    pub clusters_merged: Vec<i64>,
}

impl PassSummary {
    pub fn is_empty(&self) -> bool {
        self.files_assigned == 0 && self.clusters_merged.is_empty()
    }
}

/// An open cluster as seen by the pass, with its centroid and start time
/// kept current as files join.
struct Candidate {
    id: i64,
    lon: f64,
    lat: f64,
    weight: f64,
    min_timestamp: NaiveDateTime,
}

impl Candidate {
    fn absorb(&mut self, point: &Point<f64>, timestamp: NaiveDateTime) {
        let total = self.weight + 1.0;
        self.lon = (self.lon * self.weight + point.x()) / total;
        self.lat = (self.lat * self.weight + point.y()) / total;
        self.weight = total;
        self.min_timestamp = self.min_timestamp.min(timestamp);
    }
}

pub fn cluster_unassigned(
    tx: &mut dyn ClusterTx,
    config: &ClusteringConfig,
) -> Result<PassSummary, ClusterError> {
    let threshold = config.time_threshold();
    let mut summary = PassSummary::default();
    let mut touched = BTreeSet::new();

    let mut candidates: Vec<Candidate> = tx
        .list_clusters()?
        .into_iter()
        .filter(|c| !c.metadata.readyforsigma)
        .filter_map(|c| {
            let (lon, lat) = c.aggregates.centroid?;
            Some(Candidate {
                id: c.id,
                lon,
                lat,
                weight: c.aggregates.file_count.max(1) as f64,
                min_timestamp: c.aggregates.min_timestamp?,
            })
        })
        .collect();

    let mut assignments: BTreeMap<i64, Vec<i64>> = BTreeMap::new();

    for file in tx.unclustered_files()? {
        let point = match file.point() {
            Ok(point) => point,
            Err(e) => {
                warn!(file_id = file.id, error = %e, "Skipping file with malformed position");
                continue;
            }
        };
        let (Some(point), Some(timestamp)) = (point, file.captured_at) else {
            continue;
        };

        let nearest = candidates
            .iter_mut()
            .filter(|c| {
                let gap = if timestamp >= c.min_timestamp {
                    timestamp - c.min_timestamp
                } else {
                    c.min_timestamp - timestamp
                };
                gap <= threshold
            })
            .map(|c| {
                let distance = geometry::haversine_meters(&Point::new(c.lon, c.lat), &point);
                (distance, c)
            })
            .filter(|(distance, _)| *distance <= config.spatial_threshold_meters)
            .min_by(|a, b| a.0.total_cmp(&b.0));

        let cluster_id = match nearest {
            Some((_, candidate)) => {
                candidate.absorb(&point, timestamp);
                candidate.id
            }
            None => {
                let id = tx.next_cluster_id()?;
                tx.insert_cluster(id, &new_cluster_metadata(&file.directory))?;
                debug!(cluster_id = id, file_id = file.id, "Opened cluster");
                candidates.push(Candidate {
                    id,
                    lon: point.x(),
                    lat: point.y(),
                    weight: 1.0,
                    min_timestamp: timestamp,
                });
                summary.clusters_created.push(id);
                id
            }
        };

        assignments.entry(cluster_id).or_default().push(file.id);
    }

    for (cluster_id, file_ids) in &assignments {
        summary.files_assigned += tx.assign_files(file_ids, *cluster_id)?;
        touched.insert(*cluster_id);
    }

    for group in overlapping_clusters(tx, config)? {
        let keep_id = merge_in(tx, &group)?;
        for absorbed in group.iter().filter(|&&id| id != keep_id) {
            touched.remove(absorbed);
        }
        touched.insert(keep_id);
        summary.clusters_merged.push(keep_id);
    }

    for cluster_id in touched {
        recompute(tx, cluster_id)?;
    }

    if !summary.is_empty() {
        info!(
            files = summary.files_assigned,
            created = summary.clusters_created.len(),
            merged = summary.clusters_merged.len(),
            "Clustering pass finished"
        );
    }
    Ok(summary)
}

fn new_cluster_metadata(directory: &str) -> ClusterMetadata {
    let area = Path::new(directory)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    ClusterMetadata {
        area,
        mosaic: true,
        classify: true,
        publish: true,
        ..ClusterMetadata::default()
    }
}

/// Groups of two or more open clusters linked by at least one pair of files
/// within both thresholds of each other.
fn overlapping_clusters(
    tx: &mut dyn ClusterTx,
    config: &ClusteringConfig,
) -> Result<Vec<Vec<i64>>, ClusterError> {
    let threshold = config.time_threshold();

    let mut stamped: Vec<(NaiveDateTime, Point<f64>, i64)> = Vec::new();
    for cluster in tx.list_clusters()? {
        if cluster.metadata.readyforsigma {
            continue;
        }
        for file in tx.files_in_cluster(cluster.id)? {
            if let (Ok(Some(point)), Some(timestamp)) = (file.point(), file.captured_at) {
                stamped.push((timestamp, point, cluster.id));
            }
        }
    }
    stamped.sort_by_key(|entry| entry.0);

    let mut components = Components::default();
    for (i, (time_a, point_a, cluster_a)) in stamped.iter().enumerate() {
        for (time_b, point_b, cluster_b) in &stamped[i + 1..] {
            if *time_b - *time_a > threshold {
                break;
            }
            if cluster_a != cluster_b
                && geometry::haversine_meters(point_a, point_b) <= config.spatial_threshold_meters
            {
                components.union(*cluster_a, *cluster_b);
            }
        }
    }

    Ok(components.groups())
}

/// Disjoint sets of cluster ids, each rooted at its smallest member.
#[derive(Default)]
struct Components {
    parent: BTreeMap<i64, i64>,
}

impl Components {
    fn find(&mut self, id: i64) -> i64 {
        let parent = *self.parent.entry(id).or_insert(id);
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: i64, b: i64) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            self.parent.insert(root_a.max(root_b), root_a.min(root_b));
        }
    }

    fn groups(mut self) -> Vec<Vec<i64>> {
        let ids: Vec<i64> = self.parent.keys().copied().collect();
        let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for id in ids {
            let root = self.find(id);
            groups.entry(root).or_default().push(id);
        }
        groups.into_values().filter(|group| group.len() > 1).collect()
    }
}
