//! Allow-listed metadata edits from the map client.

use serde_json::{Map, Value};
use tracing::info;

use crate::db::{ClusterTx, PatchValue};
use crate::error::ClusterError;

/// Free-text columns the client may set.
pub const TEXT_FIELDS: &[&str] = &[
    "grouping",
    "area",
    "datetime",
    "creator_name",
    "project",
    "theme",
    "organisation",
];

/// Workflow flags the client may set.
pub const FLAG_FIELDS: &[&str] = &["mosaic", "classify", "skip", "publish", "readyforsigma"];

/// A validated set of column assignments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterPatch {
    assignments: Vec<(&'static str, PatchValue)>,
}

impl ClusterPatch {
    /// Pick the allow-listed keys out of a request object. Unknown keys and
    /// `null` values are skipped.
    pub fn from_json(fields: &Map<String, Value>) -> Result<Self, ClusterError> {
        let mut assignments = Vec::new();

        for &column in TEXT_FIELDS {
            match fields.get(column) {
                None | Some(Value::Null) => {}
                Some(Value::String(text)) => {
                    assignments.push((column, PatchValue::Text(text.clone())));
                }
                Some(Value::Number(number)) => {
                    assignments.push((column, PatchValue::Text(number.to_string())));
                }
                Some(_) => {
                    return Err(ClusterError::invalid(format!("Field {} must be a string", column)));
                }
            }
        }

        for &column in FLAG_FIELDS {
            match fields.get(column) {
                None | Some(Value::Null) => {}
                Some(value) => assignments.push((column, PatchValue::Flag(truthy(value)))),
            }
        }

        Ok(Self { assignments })
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn assignments(&self) -> &[(&'static str, PatchValue)] {
        &self.assignments
    }
}

/// Lenient boolean: `true`, non-zero numbers and the strings
/// `1`/`true`/`on`/`yes` (any case) are true.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n == 1.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        _ => false,
    }
}

pub fn update_in(
    tx: &mut dyn ClusterTx,
    cluster_id: i64,
    patch: &ClusterPatch,
) -> Result<(), ClusterError> {
    if patch.is_empty() {
        return Err(ClusterError::invalid("No updatable fields"));
    }

    if tx.update_cluster_columns(cluster_id, patch.assignments())? == 0 {
        return Err(ClusterError::not_found(format!(
            "Cluster {} does not exist",
            cluster_id
        )));
    }

    let columns: Vec<&str> = patch.assignments().iter().map(|(column, _)| *column).collect();
    info!(cluster_id, columns = ?columns, "Updated cluster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use serde_json::json;

    fn patch(value: Value) -> Result<ClusterPatch, ClusterError> {
        ClusterPatch::from_json(value.as_object().unwrap())
    }

    #[test]
    fn test_unknown_and_null_fields_ignored() {
        let p = patch(json!({
            "cluster_id": 4,
            "area": "Skerries",
            "nfiles": 900,
            "settings": {"odm_dsm": false},
            "theme": null,
        }))
        .unwrap();
        assert_eq!(p.assignments(), &[("area", PatchValue::Text("Skerries".to_string()))]);
    }

    #[test]
    fn test_flag_parsing() {
        let p = patch(json!({
            "mosaic": "on",
            "classify": "0",
            "skip": 1,
            "publish": false,
            "readyforsigma": "YES",
        }))
        .unwrap();
        assert_eq!(
            p.assignments(),
            &[
                ("mosaic", PatchValue::Flag(true)),
                ("classify", PatchValue::Flag(false)),
                ("skip", PatchValue::Flag(true)),
                ("publish", PatchValue::Flag(false)),
                ("readyforsigma", PatchValue::Flag(true)),
            ]
        );
    }

    #[test]
    fn test_non_text_value_rejected() {
        let err = patch(json!({ "area": ["a", "b"] })).unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[test]
    fn test_update_writes_columns() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 4, "Fjord");

        let p = patch(json!({
            "area": "Skerries",
            "datetime": "202406181200",
            "skip": "true",
            "mosaic": "no",
        }))
        .unwrap();
        db.run_atomic(|tx| update_in(tx, 4, &p)).unwrap();

        let cluster = db.run_atomic(|tx| tx.get_cluster(4)).unwrap().unwrap();
        assert_eq!(cluster.metadata.area.as_deref(), Some("Skerries"));
        assert_eq!(cluster.aggregates.label.as_deref(), Some("202406181200"));
        assert!(cluster.metadata.skip);
        assert!(!cluster.metadata.mosaic);
        assert_eq!(cluster.metadata.project, metadata("Fjord").project);
    }

    #[test]
    fn test_empty_patch_and_missing_cluster() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 4, "Fjord");

        let empty = patch(json!({ "bogus": 1 })).unwrap();
        let err = db.run_atomic(|tx| update_in(tx, 4, &empty)).unwrap_err();
        assert_eq!(err.to_string(), "No updatable fields");

        let p = patch(json!({ "area": "Skerries" })).unwrap();
        let err = db.run_atomic(|tx| update_in(tx, 99, &p)).unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
