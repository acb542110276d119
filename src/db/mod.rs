mod schema;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_schema;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use schema::{MIGRATIONS, SCHEMA};

use crate::config::DatabaseConfig;
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;
use crate::error::{ClusterError, GeometryError};
use crate::geometry;

/// Storage format for every timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a stored timestamp. Accepts the `T` separator we write and the space
/// separator other tools tend to write, with or without fractional seconds.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// One uploaded geotagged asset.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub directory: String,
    pub filename: String,
    pub captured_at: Option<NaiveDateTime>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub cluster_id: Option<i64>,
}

impl FileRecord {
    /// The file's position, if it has one. A half-populated or out-of-range
    /// coordinate pair is malformed rather than absent.
    pub fn point(&self) -> Result<Option<geo::Point<f64>>, GeometryError> {
        match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => geometry::point(lon, lat).map(Some),
            (None, None) => Ok(None),
            (lon, lat) => Err(GeometryError::InvalidCoordinate {
                lon: lon.unwrap_or(f64::NAN),
                lat: lat.unwrap_or(f64::NAN),
            }),
        }
    }
}

/// A file as handed over by ingestion.
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub directory: String,
    pub filename: String,
    pub captured_at: Option<NaiveDateTime>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub cluster_id: Option<i64>,
}

/// Processing configuration the downstream pipeline reads (ODM and ML options,
/// sensor, licence, ...). Carried as an opaque bag and copied verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingSettings(pub Map<String, Value>);

impl ProcessingSettings {
    pub fn to_json(&self) -> Result<String, ClusterError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ClusterError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(serde_json::from_str(text)?))
    }
}

/// Every cluster field that is not derived from member files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub grouping: Option<String>,
    pub area: Option<String>,
    pub organisation: Option<String>,
    pub creator_name: Option<String>,
    pub project: Option<String>,
    pub theme: Option<String>,
    pub mosaic: bool,
    pub classify: bool,
    pub publish: bool,
    pub readyforsigma: bool,
    pub skip: bool,
    pub senttosigma: Option<String>,
    pub settings: ProcessingSettings,
}

/// Fields derived from the current member files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregates {
    pub file_count: i64,
    pub min_timestamp: Option<NaiveDateTime>,
    pub max_timestamp: Option<NaiveDateTime>,
    /// `min_timestamp` at minute resolution, e.g. `202406181405`.
    pub label: Option<String>,
    pub centroid: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: i64,
    pub metadata: ClusterMetadata,
    pub aggregates: Aggregates,
}

/// A single column assignment from an allow-listed patch.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Text(String),
    Flag(bool),
}

/// The transactional view of the file store.
///
/// Obtained only through [`Database::run_atomic`]; everything done through it
/// commits or rolls back together.
pub trait ClusterTx {
    /// Which of `ids` exist as cluster rows, ascending.
    fn existing_cluster_ids(&mut self, ids: &[i64]) -> Result<Vec<i64>, ClusterError>;

    fn get_cluster(&mut self, id: i64) -> Result<Option<Cluster>, ClusterError>;

    fn list_clusters(&mut self) -> Result<Vec<Cluster>, ClusterError>;

    /// `max(id) + 1`, or 1 for an empty table.
    fn next_cluster_id(&mut self) -> Result<i64, ClusterError>;

    fn insert_cluster(&mut self, id: i64, metadata: &ClusterMetadata) -> Result<(), ClusterError>;

    fn delete_clusters(&mut self, ids: &[i64]) -> Result<usize, ClusterError>;

    /// Apply column assignments; returns the number of rows matched.
    fn update_cluster_columns(
        &mut self,
        id: i64,
        assignments: &[(&'static str, PatchValue)],
    ) -> Result<usize, ClusterError>;

    /// Only the aggregate recomputer calls this.
    fn write_aggregates(&mut self, id: i64, aggregates: &Aggregates) -> Result<usize, ClusterError>;

    fn files_in_cluster(&mut self, id: i64) -> Result<Vec<FileRecord>, ClusterError>;

    /// Unclustered files that have both a position and a capture time, oldest first.
    fn unclustered_files(&mut self) -> Result<Vec<FileRecord>, ClusterError>;

    /// Move every file owned by any of `from` onto `to`.
    fn reassign_clusters(&mut self, from: &[i64], to: i64) -> Result<usize, ClusterError>;

    /// Move the listed files onto `to`.
    fn assign_files(&mut self, file_ids: &[i64], to: i64) -> Result<usize, ClusterError>;

    fn insert_file(&mut self, file: &NewFile) -> Result<i64, ClusterError>;
}

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    ($self:expr, $method:ident($($arg:expr),* $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),*),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),*),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    pub fn open(config: &DatabaseConfig) -> anyhow::Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config
                    .postgresql_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
                let pool_size = config.pool_size.unwrap_or(10);
                let pg = postgres::PgDb::open(url, pool_size)?;
                return Ok(Self { inner: DatabaseInner::Postgres(pg) });
            }
        }

        let db = sqlite::SqliteDb::open(&config.sqlite_path, config.busy_timeout())?;
        Ok(Self { inner: DatabaseInner::Sqlite(db) })
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        dispatch!(self, initialize())
    }

    /// Run `op` as one unit of work. An `Err` from `op` (or from the store while
    /// committing) rolls back every write `op` made.
    pub fn run_atomic<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&mut dyn ClusterTx) -> Result<T, ClusterError>,
    {
        dispatch!(self, run_atomic(op))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub fn open_temp() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            sqlite_path: dir.path().join("fieldclusters.db"),
            ..DatabaseConfig::default()
        };
        let db = Database::open(&config).unwrap();
        db.initialize().unwrap();
        (dir, db)
    }

    pub fn temp_path(dir: &TempDir) -> PathBuf {
        dir.path().join("fieldclusters.db")
    }

    pub fn ts(value: &str) -> NaiveDateTime {
        parse_timestamp(value).unwrap()
    }

    pub fn metadata(area: &str) -> ClusterMetadata {
        let mut settings = Map::new();
        settings.insert("odm_dsm".to_string(), Value::Bool(true));
        settings.insert("odm_orthophoto_resolution".to_string(), Value::from(2.5));
        settings.insert("sensor".to_string(), Value::from("MicaSense RedEdge"));
        ClusterMetadata {
            grouping: Some("Vestland-Bergen".to_string()),
            area: Some(area.to_string()),
            organisation: Some("NIVA".to_string()),
            creator_name: Some("field team".to_string()),
            project: Some("Kelp survey".to_string()),
            theme: Some("Habitat".to_string()),
            mosaic: true,
            classify: false,
            publish: true,
            readyforsigma: false,
            skip: false,
            senttosigma: None,
            settings: ProcessingSettings(settings),
        }
    }

    pub fn add_cluster(db: &Database, id: i64, area: &str) {
        db.run_atomic(|tx| tx.insert_cluster(id, &metadata(area))).unwrap();
    }

    pub fn add_file(
        db: &Database,
        cluster_id: Option<i64>,
        name: &str,
        position: Option<(f64, f64)>,
        captured_at: Option<&str>,
    ) -> i64 {
        let file = NewFile {
            directory: "uploads/2024/mission".to_string(),
            filename: name.to_string(),
            captured_at: captured_at.map(ts),
            lon: position.map(|p| p.0),
            lat: position.map(|p| p.1),
            cluster_id,
        };
        db.run_atomic(|tx| tx.insert_file(&file)).unwrap()
    }

    pub fn owner_of(db: &Database, cluster_ids: &[i64], file_id: i64) -> Option<i64> {
        db.run_atomic(|tx| {
            for &cid in cluster_ids {
                if tx.files_in_cluster(cid)?.iter().any(|f| f.id == file_id) {
                    return Ok(Some(cid));
                }
            }
            Ok(None)
        })
        .unwrap()
    }
}
