use chrono::NaiveDate;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("attendance session for class {class_id} on {date} is closed")]
    SessionClosed { class_id: String, date: NaiveDate },
    #[error("corrupt {column} value: {detail}")]
    Corrupt { column: &'static str, detail: String },
    #[error("media i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid media reference: {0}")]
    InvalidMediaRef(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { kind, id: id.into() }
    }

    /// Constraint violations and lock contention, the failures worth retrying
    /// once when two writers race on the same row.
    pub fn is_conflict(&self) -> bool {
        let sql = match self {
            StoreError::Sql(e) => e,
            StoreError::Database(tokio_rusqlite::Error::Rusqlite(e)) => e,
            _ => return false,
        };
        matches!(
            sql.sqlite_error_code(),
            Some(ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised inside a connection closure, carried out through
/// `tokio_rusqlite::Error::Other` and restored by [`unwrap_call`].
pub(crate) fn wrap(err: StoreError) -> tokio_rusqlite::Error {
    match err {
        StoreError::Database(inner) => inner,
        StoreError::Sql(inner) => tokio_rusqlite::Error::Rusqlite(inner),
        other => tokio_rusqlite::Error::Other(Box::new(other)),
    }
}

pub(crate) fn unwrap_call(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<StoreError>() {
            Ok(store) => *store,
            Err(other) => StoreError::Database(tokio_rusqlite::Error::Other(other)),
        },
        other => StoreError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_survive_the_connection_boundary() {
        let restored = unwrap_call(wrap(StoreError::not_found("person", "p1")));
        assert!(matches!(restored, StoreError::NotFound { kind: "person", .. }));
    }

    #[test]
    fn test_constraint_violation_is_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(StoreError::Sql(err).is_conflict());
        assert!(!StoreError::not_found("person", "x").is_conflict());
    }
}
