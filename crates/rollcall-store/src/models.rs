//! Records persisted by the store.

use crate::error::{Result, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Implements `as_str`, `Display`, `FromStr` and the SQLite conversions for a
/// unit enum stored as lowercase text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Which identity backend produced an enrollment artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Corpus,
    Vector,
    Remote,
}

text_enum!(BackendKind {
    Corpus => "corpus",
    Vector => "vector",
    Remote => "remote",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Success,
    NoFace,
    Error,
}

text_enum!(DetectionStatus {
    Success => "success",
    NoFace => "no_face",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

text_enum!(AttendanceStatus {
    Present => "present",
    Absent => "absent",
    Late => "late",
});

impl AttendanceStatus {
    /// Present and late both count as having attended.
    pub fn is_attended(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

/// Backend-specific data kept for a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BackendArtifact {
    /// Path of the image file inside the corpus directory.
    CorpusFile(String),
    Embedding(Vec<f32>),
    /// Opaque face token issued by the remote provider.
    FaceToken(String),
}

impl BackendArtifact {
    pub fn backend(&self) -> BackendKind {
        match self {
            BackendArtifact::CorpusFile(_) => BackendKind::Corpus,
            BackendArtifact::Embedding(_) => BackendKind::Vector,
            BackendArtifact::FaceToken(_) => BackendKind::Remote,
        }
    }

    /// Column text: the path, the token, or the embedding as a flat JSON array.
    pub(crate) fn to_column(&self) -> Result<String> {
        match self {
            BackendArtifact::CorpusFile(path) => Ok(path.clone()),
            BackendArtifact::FaceToken(token) => Ok(token.clone()),
            BackendArtifact::Embedding(values) => {
                serde_json::to_string(values).map_err(|e| StoreError::Corrupt {
                    column: "artifact",
                    detail: e.to_string(),
                })
            }
        }
    }

    pub(crate) fn from_column(backend: BackendKind, text: String) -> rusqlite::Result<Self> {
        Ok(match backend {
            BackendKind::Corpus => BackendArtifact::CorpusFile(text),
            BackendKind::Remote => BackendArtifact::FaceToken(text),
            BackendKind::Vector => {
                let values: Vec<f32> = serde_json::from_str(&text).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })?;
                BackendArtifact::Embedding(values)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A person to create together with their class memberships.
#[derive(Debug, Clone, Default)]
pub struct NewPerson {
    pub id: String,
    pub display_name: String,
    pub class_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub code: String,
    pub name: String,
    pub instructor: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewClass {
    pub code: String,
    pub name: String,
    pub instructor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: String,
    pub person_id: String,
    pub backend: BackendKind,
    /// Media reference of the canonical image.
    pub image_path: Option<String>,
    pub artifact: Option<BackendArtifact>,
    pub is_primary: bool,
    pub detection_status: DetectionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A successful enrollment's artifact, as scanned by recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub enrollment_id: String,
    pub person_id: String,
    pub artifact: BackendArtifact,
}

/// Result of deleting an enrollment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedEnrollment {
    pub record: EnrollmentRecord,
    /// Enrollment promoted to primary because the deleted one held the flag.
    pub promoted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub total_students: u32,
    pub present_count: u32,
    pub created_by: Option<String>,
}

impl AttendanceSession {
    /// Present share of the roster snapshot, in percent. Zero for an empty roster.
    pub fn attendance_rate(&self) -> f64 {
        if self.total_students == 0 {
            return 0.0;
        }
        self.present_count as f64 / self.total_students as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub person_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub recognition_confidence: Option<f32>,
    pub marked_by_recognition: bool,
    pub image_ref: Option<String>,
    pub notes: Option<String>,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

pub(crate) fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(text: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}
