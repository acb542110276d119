//! GeoJSON read models for the map client.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::db::{format_timestamp, Cluster, ClusterTx, FileRecord};
use crate::error::ClusterError;
use crate::geometry;

/// One feature per cluster that has at least one geotagged file, ordered by
/// id. The geometry is the footprint of the member points.
pub fn cluster_features(tx: &mut dyn ClusterTx) -> Result<Value, ClusterError> {
    let mut features = Vec::new();

    for cluster in tx.list_clusters()? {
        let mut points = Vec::new();
        for file in tx.files_in_cluster(cluster.id)? {
            if let Some(point) = readable_point(&file) {
                points.push(point);
            }
        }
        let Some(footprint) = geometry::footprint_geojson(&points) else {
            continue;
        };

        features.push(json!({
            "type": "Feature",
            "geometry": footprint,
            "properties": cluster_properties(&cluster)?,
        }));
    }

    Ok(json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

/// A stored row with a malformed position is left off the map instead of
/// failing the whole response.
fn readable_point(file: &FileRecord) -> Option<geo::Point<f64>> {
    match file.point() {
        Ok(point) => point,
        Err(e) => {
            warn!(file_id = file.id, error = %e, "Skipping file with malformed position");
            None
        }
    }
}

/// Settings go in first so no settings key can shadow a named field.
fn cluster_properties(cluster: &Cluster) -> Result<Map<String, Value>, ClusterError> {
    let mut properties = Map::new();
    let mut fields = match serde_json::to_value(&cluster.metadata)? {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    if let Some(Value::Object(settings)) = fields.remove("settings") {
        properties.extend(settings);
    }
    properties.insert("cluster_id".to_string(), json!(cluster.id));
    properties.extend(fields);

    let aggregates = &cluster.aggregates;
    properties.insert("nfiles".to_string(), json!(aggregates.file_count));
    properties.insert("datetime".to_string(), json!(aggregates.label));
    properties.insert(
        "min_datetime".to_string(),
        json!(aggregates.min_timestamp.as_ref().map(format_timestamp)),
    );
    properties.insert(
        "max_datetime".to_string(),
        json!(aggregates.max_timestamp.as_ref().map(format_timestamp)),
    );
    properties.insert("centroid_lon".to_string(), json!(aggregates.centroid.map(|c| c.0)));
    properties.insert("centroid_lat".to_string(), json!(aggregates.centroid.map(|c| c.1)));

    Ok(properties)
}

/// Summary and point features for the files of one cluster.
pub fn cluster_points(tx: &mut dyn ClusterTx, cluster_id: i64) -> Result<Value, ClusterError> {
    if tx.existing_cluster_ids(&[cluster_id])?.is_empty() {
        return Err(ClusterError::not_found(format!(
            "Cluster {} does not exist",
            cluster_id
        )));
    }

    let files = tx.files_in_cluster(cluster_id)?;

    let timestamps: Vec<_> = files.iter().filter_map(|f| f.captured_at).collect();
    let directories: BTreeSet<&str> = files.iter().map(|f| f.directory.as_str()).collect();

    let mut features = Vec::new();
    for file in &files {
        let Some(point) = readable_point(file) else {
            continue;
        };
        features.push(json!({
            "type": "Feature",
            "geometry": {
                "type": "Point",
                "coordinates": [point.x(), point.y()],
            },
            "properties": {
                "file_id": file.id,
                "filename": file.filename,
                "datetimetaken": file.captured_at.as_ref().map(format_timestamp),
                "directory": file.directory,
                "cluster_id": cluster_id,
                "lon": point.x(),
                "lat": point.y(),
            },
        }));
    }

    Ok(json!({
        "type": "FeatureCollection",
        "summary": {
            "cluster_id": cluster_id,
            "nfiles": timestamps.len(),
            "first_timestamp": timestamps.iter().min().map(format_timestamp),
            "last_timestamp": timestamps.iter().max().map(format_timestamp),
            "directories": directories,
        },
        "features": features,
    }))
}
