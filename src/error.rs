//! Error taxonomy for cluster operations.
//!
//! Every failure that crosses the store boundary is one of these variants, so
//! callers can tell a retryable conflict apart from a bad request without
//! inspecting message strings.

use thiserror::Error;

/// Malformed geometry handed to the geometry adapter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("polygon needs at least 3 distinct vertices, got {0}")]
    DegeneratePolygon(usize),

    #[error("invalid coordinate ({lon}, {lat})")]
    InvalidCoordinate { lon: f64, lat: f64 },

    #[error("unsupported geometry type: {0}")]
    UnsupportedType(String),

    #[error("malformed GeoJSON: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// A concurrent writer won; nothing was committed and the call may be retried.
    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error("invalid geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("store error: {0}")]
    Store(String),
}

impl ClusterError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ClusterError::InvalidRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ClusterError::NotFound(message.into())
    }

    /// Geometry errors are caller input errors, same as `InvalidRequest`.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, ClusterError::InvalidRequest(_) | ClusterError::Geometry(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

impl From<rusqlite::Error> for ClusterError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                ClusterError::Conflict(err.to_string())
            }
            _ => ClusterError::Store(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Store(format!("settings encoding: {}", err))
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for ClusterError {
    fn from(err: postgres::Error) -> Self {
        use postgres::error::SqlState;

        let conflict = err.code().is_some_and(|code| {
            *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::UNIQUE_VIOLATION
        });
        if conflict {
            ClusterError::Conflict(err.to_string())
        } else {
            ClusterError::Store(err.to_string())
        }
    }
}

#[cfg(feature = "postgres")]
impl From<r2d2::Error> for ClusterError {
    fn from(err: r2d2::Error) -> Self {
        ClusterError::Store(format!("connection pool: {}", err))
    }
}
