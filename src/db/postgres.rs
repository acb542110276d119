//! PostgreSQL backend implementation.

use anyhow::Result;
use postgres::types::ToSql;
use postgres::{IsolationLevel, NoTls, Row, Transaction};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use tracing::{debug, warn};

use super::postgres_schema::POSTGRES_SCHEMA;
use super::{
    format_timestamp, parse_timestamp, Aggregates, Cluster, ClusterMetadata, ClusterTx,
    FileRecord, NewFile, PatchValue, ProcessingSettings,
};
use crate::error::ClusterError;

const CLUSTER_COLUMNS: &str = r#"
    id, "grouping", area, organisation, creator_name, project, theme,
    mosaic, classify, publish, readyforsigma, skip, senttosigma, settings,
    nfiles, "datetime", min_datetime, max_datetime, centroid_lon, centroid_lat
"#;

const FILE_COLUMNS: &str = "id, directory, filename, datetimetaken, lon, lat, cluster_id";

pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32) -> Result<Self> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self { pool })
    }

    pub fn initialize(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    /// Runs under `SERIALIZABLE`; the server aborts one of two conflicting
    /// writers, which surfaces as [`ClusterError::Conflict`].
    pub fn run_atomic<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&mut dyn ClusterTx) -> Result<T, ClusterError>,
    {
        let mut client = self.pool.get()?;
        let mut tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()?;

        let result = {
            let mut unit = PgTx { tx: &mut tx };
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

fn row_to_cluster(row: &Row) -> Result<Cluster, ClusterError> {
    let settings_text: String = row.get(13);
    let min_datetime: Option<String> = row.get(16);
    let max_datetime: Option<String> = row.get(17);
    let centroid_lon: Option<f64> = row.get(18);
    let centroid_lat: Option<f64> = row.get(19);

    Ok(Cluster {
        id: row.get(0),
        metadata: ClusterMetadata {
            grouping: row.get(1),
            area: row.get(2),
            organisation: row.get(3),
            creator_name: row.get(4),
            project: row.get(5),
            theme: row.get(6),
            mosaic: row.get(7),
            classify: row.get(8),
            publish: row.get(9),
            readyforsigma: row.get(10),
            skip: row.get(11),
            senttosigma: row.get(12),
            settings: ProcessingSettings::from_json(&settings_text)?,
        },
        aggregates: Aggregates {
            file_count: row.get(14),
            label: row.get(15),
            min_timestamp: min_datetime.as_deref().and_then(parse_timestamp),
            max_timestamp: max_datetime.as_deref().and_then(parse_timestamp),
            centroid: centroid_lon.zip(centroid_lat),
        },
    })
}

fn row_to_file(row: &Row) -> Result<FileRecord, ClusterError> {
    let taken: Option<String> = row.get(3);
    let captured_at = match taken.as_deref() {
        Some(text) => Some(parse_timestamp(text).ok_or_else(|| {
            ClusterError::Store(format!("unparseable datetimetaken {:?}", text))
        })?),
        None => None,
    };
    Ok(FileRecord {
        id: row.get(0),
        directory: row.get(1),
        filename: row.get(2),
        captured_at,
        lon: row.get(4),
        lat: row.get(5),
        cluster_id: row.get(6),
    })
}

struct PgTx<'a, 'conn> {
    tx: &'a mut Transaction<'conn>,
}

impl ClusterTx for PgTx<'_, '_> {
    fn existing_cluster_ids(&mut self, ids: &[i64]) -> Result<Vec<i64>, ClusterError> {
        let ids = ids.to_vec();
        let rows = self.tx.query(
            "SELECT id FROM clusters WHERE id = ANY($1) ORDER BY id",
            &[&ids],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn get_cluster(&mut self, id: i64) -> Result<Option<Cluster>, ClusterError> {
        let sql = format!("SELECT {} FROM clusters WHERE id = $1", CLUSTER_COLUMNS);
        match self.tx.query_opt(&sql, &[&id])? {
            Some(row) => Ok(Some(row_to_cluster(&row)?)),
            None => Ok(None),
        }
    }

    fn list_clusters(&mut self) -> Result<Vec<Cluster>, ClusterError> {
        let sql = format!("SELECT {} FROM clusters ORDER BY id", CLUSTER_COLUMNS);
        let rows = self.tx.query(&sql, &[])?;
        rows.iter().map(row_to_cluster).collect()
    }

    fn next_cluster_id(&mut self) -> Result<i64, ClusterError> {
        let row = self
            .tx
            .query_one("SELECT COALESCE(MAX(id), 0) + 1 FROM clusters", &[])?;
        Ok(row.get(0))
    }

    fn insert_cluster(&mut self, id: i64, metadata: &ClusterMetadata) -> Result<(), ClusterError> {
        let settings = metadata.settings.to_json()?;
        self.tx.execute(
            r#"
            INSERT INTO clusters (
                id, "grouping", area, organisation, creator_name, project, theme,
                mosaic, classify, publish, readyforsigma, skip, senttosigma, settings
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            &[
                &id,
                &metadata.grouping,
                &metadata.area,
                &metadata.organisation,
                &metadata.creator_name,
                &metadata.project,
                &metadata.theme,
                &metadata.mosaic,
                &metadata.classify,
                &metadata.publish,
                &metadata.readyforsigma,
                &metadata.skip,
                &metadata.senttosigma,
                &settings,
            ],
        )?;
        Ok(())
    }

    fn delete_clusters(&mut self, ids: &[i64]) -> Result<usize, ClusterError> {
        let ids = ids.to_vec();
        let deleted = self
            .tx
            .execute("DELETE FROM clusters WHERE id = ANY($1)", &[&ids])?;
        Ok(deleted as usize)
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
            .enumerate()
            .map(|(idx, (column, _))| format!("\"{}\" = ${}", column, idx + 1))
            .collect();
        let sql = format!(
            "UPDATE clusters SET {} WHERE id = ${}",
            sets.join(", "),
            assignments.len() + 1
        );

        let mut params: Vec<&(dyn ToSql + Sync)> = assignments
            .iter()
            .map(|(_, value)| match value {
                PatchValue::Text(text) => text as &(dyn ToSql + Sync),
                PatchValue::Flag(flag) => flag as &(dyn ToSql + Sync),
            })
            .collect();
        params.push(&id);

        let updated = self.tx.execute(&sql, &params)?;
        Ok(updated as usize)
    }

    fn write_aggregates(&mut self, id: i64, aggregates: &Aggregates) -> Result<usize, ClusterError> {
        let min_datetime = aggregates.min_timestamp.as_ref().map(format_timestamp);
        let max_datetime = aggregates.max_timestamp.as_ref().map(format_timestamp);
        let centroid_lon = aggregates.centroid.map(|c| c.0);
        let centroid_lat = aggregates.centroid.map(|c| c.1);
        let updated = self.tx.execute(
            r#"
            UPDATE clusters
               SET nfiles = $1,
                   "datetime" = $2,
                   min_datetime = $3,
                   max_datetime = $4,
                   centroid_lon = $5,
                   centroid_lat = $6
             WHERE id = $7
            "#,
            &[
                &aggregates.file_count,
                &aggregates.label,
                &min_datetime,
                &max_datetime,
                &centroid_lon,
                &centroid_lat,
                &id,
            ],
        )?;
        Ok(updated as usize)
    }

    fn files_in_cluster(&mut self, id: i64) -> Result<Vec<FileRecord>, ClusterError> {
        let sql = format!(
            "SELECT {} FROM files WHERE cluster_id = $1 ORDER BY id",
            FILE_COLUMNS
        );
        let rows = self.tx.query(&sql, &[&id])?;
        rows.iter().map(row_to_file).collect()
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
        let rows = self.tx.query(&sql, &[])?;
        rows.iter().map(row_to_file).collect()
    }

    fn reassign_clusters(&mut self, from: &[i64], to: i64) -> Result<usize, ClusterError> {
        let from = from.to_vec();
        let moved = self.tx.execute(
            "UPDATE files SET cluster_id = $1 WHERE cluster_id = ANY($2)",
            &[&to, &from],
        )?;
        Ok(moved as usize)
    }

    fn assign_files(&mut self, file_ids: &[i64], to: i64) -> Result<usize, ClusterError> {
        let file_ids = file_ids.to_vec();
        let moved = self.tx.execute(
            "UPDATE files SET cluster_id = $1 WHERE id = ANY($2)",
            &[&to, &file_ids],
        )?;
        Ok(moved as usize)
    }

    fn insert_file(&mut self, file: &NewFile) -> Result<i64, ClusterError> {
        let taken = file.captured_at.as_ref().map(format_timestamp);
        let row = self.tx.query_one(
            r#"
            INSERT INTO files (directory, filename, datetimetaken, lon, lat, cluster_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
            &[
                &file.directory,
                &file.filename,
                &taken,
                &file.lon,
                &file.lat,
                &file.cluster_id,
            ],
        )?;
        Ok(row.get(0))
    }
}
