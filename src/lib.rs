//! Geotagged upload clustering: grouping files into missions, and merging and
//! splitting those groupings without ever leaving a file orphaned or a
//! cluster's derived fields stale.

pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod server;

pub use config::Config;
pub use db::Database;
pub use error::{ClusterError, GeometryError};
