//! rollcall-store: SQLite persistence for rosters, enrollments and attendance.
//!
//! All database access goes through one `tokio-rusqlite` connection, so writes
//! are serialized; multi-statement writes run in a single immediate transaction.

pub mod attendance;
pub mod enrollments;
pub mod error;
pub mod media;
pub mod models;
pub mod roster;
mod schema;

use std::path::Path;
use tokio_rusqlite::Connection;

pub use attendance::{MarkMode, MarkOutcome, MarkRequest};
pub use error::{Result, StoreError};
pub use media::MediaStore;
pub use models::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, BackendArtifact, BackendKind, Class,
    DeletedEnrollment, DetectionStatus, EnrollmentRecord, NewClass, NewPerson, Person,
    StoredArtifact,
};

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path).await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            schema::apply_pragmas(conn)?;
            schema::migrate(conn)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Run `f` on the connection thread, restoring domain errors raised inside it.
    pub(crate) async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| f(conn).map_err(error::wrap))
            .await
            .map_err(error::unwrap_call)
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
