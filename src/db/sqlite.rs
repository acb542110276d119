//! SQLite backend implementation.

use anyhow::Result;
use rusqlite::types::{ToSqlOutput, Type};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use super::schema::{MIGRATIONS, SCHEMA};
use super::{
    format_timestamp, parse_timestamp, Aggregates, Cluster, ClusterMetadata, ClusterTx,
    FileRecord, NewFile, PatchValue, ProcessingSettings,
};
use crate::error::ClusterError;

/// SQLite caps bound parameters per statement; stay well below it.
const MAX_PARAMS: usize = 500;

const CLUSTER_COLUMNS: &str = r#"
    id, "grouping", area, organisation, creator_name, project, theme,
    mosaic, classify, publish, readyforsigma, skip, senttosigma, settings,
    nfiles, "datetime", min_datetime, max_datetime, centroid_lon, centroid_lat
"#;

const FILE_COLUMNS: &str = "id, directory, filename, datetimetaken, lon, lat, cluster_id";

pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite database");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection mutex poisoned"))?;
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    /// `IMMEDIATE` takes the write lock before the first read, so a
    /// read-then-insert such as `max(id) + 1` cannot interleave with another
    /// writer, in this process or another one sharing the file.
    pub fn run_atomic<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&mut dyn ClusterTx) -> Result<T, ClusterError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| ClusterError::Store("SQLite connection mutex poisoned".to_string()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = {
            let mut unit = SqliteTx { conn: &*tx };
            op(&mut unit)
        };

        match result {
            Ok(value) => {
                tx.commit()?;
                debug!("Committed unit of work");
                Ok(value)
            }
            Err(err) => {
                if err.is_invalid_request() {
                    debug!(error = %err, "Rolling back unit of work");
                } else {
                    warn!(error = %err, "Rolling back unit of work");
                }
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl ToSql for PatchValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            PatchValue::Text(text) => text.to_sql(),
            PatchValue::Flag(flag) => flag.to_sql(),
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn row_to_cluster(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    let settings_text: String = row.get(13)?;
    let settings = ProcessingSettings::from_json(&settings_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))?;

    let min_datetime: Option<String> = row.get(16)?;
    let max_datetime: Option<String> = row.get(17)?;
    let centroid_lon: Option<f64> = row.get(18)?;
    let centroid_lat: Option<f64> = row.get(19)?;

    Ok(Cluster {
        id: row.get(0)?,
        metadata: ClusterMetadata {
            grouping: row.get(1)?,
            area: row.get(2)?,
            organisation: row.get(3)?,
            creator_name: row.get(4)?,
            project: row.get(5)?,
            theme: row.get(6)?,
            mosaic: row.get(7)?,
            classify: row.get(8)?,
            publish: row.get(9)?,
            readyforsigma: row.get(10)?,
            skip: row.get(11)?,
            senttosigma: row.get(12)?,
            settings,
        },
        aggregates: Aggregates {
            file_count: row.get(14)?,
            label: row.get(15)?,
            min_timestamp: min_datetime.as_deref().and_then(parse_timestamp),
            max_timestamp: max_datetime.as_deref().and_then(parse_timestamp),
            centroid: centroid_lon.zip(centroid_lat),
        },
    })
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let taken: Option<String> = row.get(3)?;
    let captured_at = match taken.as_deref() {
        Some(text) => Some(parse_timestamp(text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                Box::new(ClusterError::Store(format!("unparseable datetimetaken {:?}", text))),
            )
        })?),
        None => None,
    };
    Ok(FileRecord {
        id: row.get(0)?,
        directory: row.get(1)?,
        filename: row.get(2)?,
        captured_at,
        lon: row.get(4)?,
        lat: row.get(5)?,
        cluster_id: row.get(6)?,
    })
}

/// One open `IMMEDIATE` transaction.
struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl ClusterTx for SqliteTx<'_> {
    fn existing_cluster_ids(&mut self, ids: &[i64]) -> Result<Vec<i64>, ClusterError> {
        let mut found = Vec::new();
        for chunk in ids.chunks(MAX_PARAMS) {
            let sql = format!(
                "SELECT id FROM clusters WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            for id in rows {
                found.push(id?);
            }
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn get_cluster(&mut self, id: i64) -> Result<Option<Cluster>, ClusterError> {
        let sql = format!("SELECT {} FROM clusters WHERE id = ?", CLUSTER_COLUMNS);
        let cluster = self
            .conn
            .query_row(&sql, [id], row_to_cluster)
            .optional()?;
        Ok(cluster)
    }

    fn list_clusters(&mut self) -> Result<Vec<Cluster>, ClusterError> {
        let sql = format!("SELECT {} FROM clusters ORDER BY id", CLUSTER_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let clusters = stmt
            .query_map([], row_to_cluster)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clusters)
    }

    fn next_cluster_id(&mut self) -> Result<i64, ClusterError> {
        let next = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM clusters",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    fn insert_cluster(&mut self, id: i64, metadata: &ClusterMetadata) -> Result<(), ClusterError> {
        let settings = metadata.settings.to_json()?;
        self.conn.execute(
            r#"
            INSERT INTO clusters (
                id, "grouping", area, organisation, creator_name, project, theme,
                mosaic, classify, publish, readyforsigma, skip, senttosigma, settings
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                id,
                metadata.grouping,
                metadata.area,
                metadata.organisation,
                metadata.creator_name,
                metadata.project,
                metadata.theme,
                metadata.mosaic,
                metadata.classify,
                metadata.publish,
                metadata.readyforsigma,
                metadata.skip,
                metadata.senttosigma,
                settings,
            ],
        )?;
        Ok(())
    }

    fn delete_clusters(&mut self, ids: &[i64]) -> Result<usize, ClusterError> {
        let mut deleted = 0;
        for chunk in ids.chunks(MAX_PARAMS) {
            let sql = format!(
                "DELETE FROM clusters WHERE id IN ({})",
                placeholders(chunk.len())
            );
            deleted += self.conn.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        Ok(deleted)
    }

    fn update_cluster_columns(
        &mut self,
        id: i64,
        assignments: &[(&'static str, PatchValue)],
    ) -> Result<usize, ClusterError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let sets: Vec<String> = assignments
            .iter()
            .map(|(column, _)| format!("\"{}\" = ?", column))
            .collect();
        let sql = format!("UPDATE clusters SET {} WHERE id = ?", sets.join(", "));

        let mut values: Vec<&dyn ToSql> = assignments.iter().map(|(_, v)| v as &dyn ToSql).collect();
        values.push(&id);
        let updated = self.conn.execute(&sql, values.as_slice())?;
        Ok(updated)
    }

    fn write_aggregates(&mut self, id: i64, aggregates: &Aggregates) -> Result<usize, ClusterError> {
        let updated = self.conn.execute(
            r#"
            UPDATE clusters
               SET nfiles = ?,
                   "datetime" = ?,
                   min_datetime = ?,
                   max_datetime = ?,
                   centroid_lon = ?,
                   centroid_lat = ?
             WHERE id = ?
            "#,
            params![
                aggregates.file_count,
                aggregates.label,
                aggregates.min_timestamp.as_ref().map(format_timestamp),
                aggregates.max_timestamp.as_ref().map(format_timestamp),
                aggregates.centroid.map(|c| c.0),
                aggregates.centroid.map(|c| c.1),
                id,
            ],
        )?;
        Ok(updated)
    }

    fn files_in_cluster(&mut self, id: i64) -> Result<Vec<FileRecord>, ClusterError> {
        let sql = format!(
            "SELECT {} FROM files WHERE cluster_id = ? ORDER BY id",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let files = stmt
            .query_map([id], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn unclustered_files(&mut self) -> Result<Vec<FileRecord>, ClusterError> {
        let sql = format!(
            r#"
            SELECT {} FROM files
             WHERE cluster_id IS NULL
               AND lon IS NOT NULL
               AND lat IS NOT NULL
               AND datetimetaken IS NOT NULL
             ORDER BY datetimetaken, id
            "#,
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let files = stmt
            .query_map([], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn reassign_clusters(&mut self, from: &[i64], to: i64) -> Result<usize, ClusterError> {
        let mut moved = 0;
        for chunk in from.chunks(MAX_PARAMS) {
            let sql = format!(
                "UPDATE files SET cluster_id = ? WHERE cluster_id IN ({})",
                placeholders(chunk.len())
            );
            let values = std::iter::once(to).chain(chunk.iter().copied());
            moved += self.conn.execute(&sql, params_from_iter(values))?;
        }
        Ok(moved)
    }

    fn assign_files(&mut self, file_ids: &[i64], to: i64) -> Result<usize, ClusterError> {
        let mut moved = 0;
        for chunk in file_ids.chunks(MAX_PARAMS) {
            let sql = format!(
                "UPDATE files SET cluster_id = ? WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let values = std::iter::once(to).chain(chunk.iter().copied());
            moved += self.conn.execute(&sql, params_from_iter(values))?;
        }
        Ok(moved)
    }

    fn insert_file(&mut self, file: &NewFile) -> Result<i64, ClusterError> {
        self.conn.execute(
            r#"
            INSERT INTO files (directory, filename, datetimetaken, lon, lat, cluster_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                file.directory,
                file.filename,
                file.captured_at.as_ref().map(format_timestamp),
                file.lon,
                file.lat,
                file.cluster_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_foreign_key_enforced() {
        let (_dir, db) = open_temp();
        let result = db.run_atomic(|tx| {
            tx.insert_file(&NewFile {
                directory: "d".to_string(),
                filename: "orphan.jpg".to_string(),
                cluster_id: Some(42),
                ..NewFile::default()
            })
        });
        assert!(matches!(result, Err(ClusterError::Store(_))));
    }

    #[test]
    fn test_unclustered_files_filters_and_orders() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");
        let late = add_file(&db, None, "late.jpg", Some((10.0, 60.0)), Some("2024-06-18T12:00:00"));
        let early = add_file(&db, None, "early.jpg", Some((10.0, 60.0)), Some("2024-06-18T09:00:00"));
        add_file(&db, None, "nogps.jpg", None, Some("2024-06-18T10:00:00"));
        add_file(&db, None, "notime.jpg", Some((10.0, 60.0)), None);
        add_file(&db, Some(1), "owned.jpg", Some((10.0, 60.0)), Some("2024-06-18T08:00:00"));

        let files = db.run_atomic(|tx| tx.unclustered_files()).unwrap();
        let ids: Vec<i64> = files.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[test]
    fn test_update_columns_and_counts() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");

        let assignments = [
            ("area", PatchValue::Text("Skerries".to_string())),
            ("skip", PatchValue::Flag(true)),
        ];
        let updated = db
            .run_atomic(|tx| tx.update_cluster_columns(1, &assignments))
            .unwrap();
        assert_eq!(updated, 1);

        let cluster = db.run_atomic(|tx| tx.get_cluster(1)).unwrap().unwrap();
        assert_eq!(cluster.metadata.area.as_deref(), Some("Skerries"));
        assert!(cluster.metadata.skip);

        let missing = db
            .run_atomic(|tx| tx.update_cluster_columns(99, &assignments))
            .unwrap();
        assert_eq!(missing, 0);
    }

    #[test]
    fn test_large_id_lists_are_chunked() {
        let (_dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");
        let ids: Vec<i64> = (1..=1200).collect();
        let found = db.run_atomic(|tx| tx.existing_cluster_ids(&ids)).unwrap();
        assert_eq!(found, vec![1]);
        assert_eq!(db.run_atomic(|tx| tx.assign_files(&ids, 1)).unwrap(), 0);
    }

    #[test]
    fn test_fractional_seconds_reach_aggregates() {
        let (dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");
        add_file(&db, Some(1), "a.jpg", Some((10.0, 60.0)), Some("2024-06-18T14:05:09"));
        let raw = Connection::open(temp_path(&dir)).unwrap();
        raw.execute(
            "INSERT INTO files (directory, filename, datetimetaken, lon, lat, cluster_id)
             VALUES ('uploads', 'b.jpg', '2024-06-18T13:59:30.500', 10.0, 60.0, 1)",
            [],
        )
        .unwrap();

        let aggregates = db.run_atomic(|tx| crate::cluster::recompute(tx, 1)).unwrap();
        assert_eq!(aggregates.file_count, 2);
        assert_eq!(aggregates.min_timestamp, Some(ts("2024-06-18T13:59:30.500")));
        assert_eq!(aggregates.label.as_deref(), Some("202406181359"));
    }

    #[test]
    fn test_unparseable_timestamp_is_store_error() {
        let (dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");
        let file = add_file(&db, Some(1), "a.jpg", Some((10.0, 60.0)), Some("2024-06-18T14:05:09"));
        db.run_atomic(|tx| crate::cluster::recompute(tx, 1)).unwrap();

        let raw = Connection::open(temp_path(&dir)).unwrap();
        raw.execute(
            "UPDATE files SET datetimetaken = 'last tuesday' WHERE id = ?1",
            [file],
        )
        .unwrap();

        let err = db.run_atomic(|tx| crate::cluster::recompute(tx, 1)).unwrap_err();
        assert!(matches!(err, ClusterError::Store(ref msg) if msg.contains("last tuesday")));

        let cluster = db.run_atomic(|tx| tx.get_cluster(1)).unwrap().unwrap();
        assert_eq!(cluster.aggregates.min_timestamp, Some(ts("2024-06-18T14:05:09")));
    }

    #[test]
    fn test_second_writer_gets_conflict() {
        let (dir, db) = open_temp();
        add_cluster(&db, 1, "Fjord");

        let config = crate::config::DatabaseConfig {
            sqlite_path: temp_path(&dir),
            busy_timeout_ms: 50,
            ..crate::config::DatabaseConfig::default()
        };
        let second = Database::open(&config).unwrap();

        let contended = db
            .run_atomic(|tx| {
                let id = tx.next_cluster_id()?;
                tx.insert_cluster(id, &metadata("First"))?;
                Ok(second.run_atomic(|other| {
                    let id = other.next_cluster_id()?;
                    other.insert_cluster(id, &metadata("Second"))?;
                    Ok(id)
                }))
            })
            .unwrap();

        let err = contended.unwrap_err();
        assert!(err.is_retryable(), "{}", err);
        assert!(matches!(err, ClusterError::Conflict(_)));

        let areas: Vec<Option<String>> = db
            .run_atomic(|tx| tx.list_clusters())
            .unwrap()
            .into_iter()
            .map(|c| c.metadata.area)
            .collect();
        assert_eq!(areas, vec![Some("Fjord".to_string()), Some("First".to_string())]);

        // Once the first unit has committed the second handle writes normally.
        let id = second
            .run_atomic(|tx| {
                let id = tx.next_cluster_id()?;
                tx.insert_cluster(id, &metadata("Second"))?;
                Ok(id)
            })
            .unwrap();
        assert_eq!(id, 3);
    }
}
