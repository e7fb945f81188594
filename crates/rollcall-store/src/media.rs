//! Filesystem store for canonical enrollment images and attendance captures.
//!
//! References handed out are relative to the media root, so the root can move.

use crate::error::{Result, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

/// Reduce an identifier to a single safe path segment.
fn segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a reference, refusing anything that escapes the root.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || reference.is_empty() {
            return Err(StoreError::InvalidMediaRef(reference.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write(&self, reference: String, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(&reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "media written");
        Ok(reference)
    }

    /// `enrollments/<person>/<enrollment>.png`
    pub async fn save_enrollment_image(&self, person_id: &str, enrollment_id: &str, png: &[u8]) -> Result<String> {
        let reference = format!("enrollments/{}/{}.png", segment(person_id), segment(enrollment_id));
        self.write(reference, png).await
    }

    /// `attendance/<class>/<date>/<person>_<HHMMSSmmm>.png`
    pub async fn save_attendance_capture(
        &self,
        class_id: &str,
        date: NaiveDate,
        person_id: &str,
        at: DateTime<Utc>,
        png: &[u8],
    ) -> Result<String> {
        let reference = format!(
            "attendance/{}/{}/{}_{}.png",
            segment(class_id),
            date.format("%Y-%m-%d"),
            segment(person_id),
            at.format("%H%M%S%3f")
        );
        self.write(reference, png).await
    }

    pub async fn read(&self, reference: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(reference)?).await?)
    }

    /// Remove a stored file. Returns false when it was already gone.
    pub async fn remove(&self, reference: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.resolve(reference)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
