use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::AppState;
use crate::cluster::{self, ClusterPatch};
use crate::db::Database;
use crate::error::ClusterError;

type ApiResult = Result<Json<Value>, ClusterError>;

/// Run store work off the async runtime.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ClusterError>
where
    F: FnOnce(&Database) -> Result<T, ClusterError> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| ClusterError::Store(format!("worker task failed: {}", e)))?
}

/// Bodies are read raw so malformed JSON still gets a structured reply.
fn json_object(body: &Bytes) -> Result<Map<String, Value>, ClusterError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(ClusterError::invalid("Request body must be a JSON object")),
        Err(e) => Err(ClusterError::invalid(format!("Invalid JSON: {}", e))),
    }
}

/// Ids arrive as numbers or numeric strings depending on the client.
fn as_id(value: &Value) -> Option<i64> {
    let id = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    id.filter(|id| *id > 0)
}

fn cluster_id(fields: &Map<String, Value>) -> Option<i64> {
    fields.get("cluster_id").and_then(as_id)
}

pub async fn merge(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let fields = json_object(&body)?;
    let ids = match fields.get("clusters") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                as_id(item).ok_or_else(|| ClusterError::invalid(format!("Invalid cluster ID: {}", item)))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(ClusterError::invalid("Need at least two cluster IDs")),
    };

    let new_id = blocking(&state, move |db| cluster::merge(db, &ids)).await?;
    Ok(Json(json!({ "success": true, "new_id": new_id })))
}

pub async fn split(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let fields = json_object(&body)?;
    let missing = || ClusterError::invalid("Missing cluster_id or polygon");

    let source_id = cluster_id(&fields).ok_or_else(missing)?;
    let polygon = match fields.get("polygon") {
        Some(value @ Value::Object(_)) => value.clone(),
        // Some clients send the geometry JSON-encoded.
        Some(Value::String(text)) => serde_json::from_str(text)
            .map_err(|e| ClusterError::invalid(format!("Invalid polygon: {}", e)))?,
        _ => return Err(missing()),
    };

    let outcome = blocking(&state, move |db| cluster::split(db, source_id, &polygon)).await?;
    Ok(Json(json!({
        "success": true,
        "new_id": outcome.new_id,
        "bounds1": outcome.source_bounds,
        "bounds2": outcome.new_bounds,
    })))
}

pub async fn update(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let fields = json_object(&body)?;
    let id = cluster_id(&fields).ok_or_else(|| ClusterError::invalid("Missing cluster_id"))?;
    let patch = ClusterPatch::from_json(&fields)?;

    blocking(&state, move |db| cluster::update(db, id, &patch)).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn clusters(State(state): State<AppState>) -> ApiResult {
    let collection = blocking(&state, cluster::clusters_geojson).await?;
    Ok(Json(collection))
}

#[derive(Debug, Deserialize)]
pub struct PointsQuery {
    cluster_id: Option<String>,
}

pub async fn points(State(state): State<AppState>, Query(query): Query<PointsQuery>) -> ApiResult {
    let id = query
        .cluster_id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| ClusterError::invalid("Missing cluster_id"))?;

    let body = blocking(&state, move |db| cluster::points_geojson(db, id)).await?;
    Ok(Json(body))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
