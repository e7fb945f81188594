//! Embedding-corpus search.
//!
//! Enrollment images live in `<root>/<person>/face_<enrollment>.png`, with the
//! person id percent-encoded. Their embeddings are memoized in memory and in
//! `<root>/representations_<model>.json`; any change to the corpus drops both,
//! and the next search rebuilds them. Identity comes from the enrollment rows,
//! so a file only takes part in a search while its enrollment is a success of
//! an active person.

use super::local::LocalAnalysis;
use super::BackendMatch;
use crate::error::{BackendError, EnrollmentFailure};
use image::RgbImage;
use rollcall_core::payload;
use rollcall_core::{nearest, DistanceMetric, Embedding, GalleryEntry, MatchDecision, MatchPolicy};
use rollcall_store::{BackendArtifact, BackendKind, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// One memoized corpus image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Representation {
    person_id: String,
    /// Path relative to the corpus root.
    file: String,
    values: Vec<f32>,
}

pub struct CorpusBackend {
    root: PathBuf,
    store: Store,
    analysis: LocalAnalysis,
    metric: DistanceMetric,
    policy: MatchPolicy,
    cache: RwLock<Option<Arc<Vec<GalleryEntry>>>>,
}

fn safe_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Reversible directory name for a person id.
fn person_dir(person_id: &str) -> String {
    let encoded = urlencoding::encode(person_id).into_owned();
    match encoded.as_str() {
        "" => "%".to_string(),
        "." | ".." => encoded.replace('.', "%2E"),
        _ => encoded,
    }
}

fn person_from_dir(name: &str) -> Option<String> {
    if name == "%" {
        return Some(String::new());
    }
    urlencoding::decode(name).ok().map(|id| id.into_owned())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl CorpusBackend {
    pub fn new(
        root: PathBuf,
        store: Store,
        analysis: LocalAnalysis,
        metric: DistanceMetric,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            root,
            store,
            analysis,
            metric,
            policy,
            cache: RwLock::new(None),
        }
    }

    pub(crate) fn analysis(&self) -> &LocalAnalysis {
        &self.analysis
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `representations_<model>.json` in the corpus root.
    pub fn cache_file(&self) -> PathBuf {
        let model = safe_segment(self.analysis.model_version());
        self.root.join(format!("representations_{model}.json"))
    }

    fn resolve(&self, file: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(file);
        if file.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(BackendError::Cache(format!("corpus path escapes the root: {file}")));
        }
        Ok(self.root.join(relative))
    }

    pub async fn enroll_face(
        &self,
        person_id: &str,
        image: &Arc<RgbImage>,
        enrollment_id: &str,
    ) -> Result<BackendArtifact, EnrollmentFailure> {
        if self.analysis.embed_primary(image).await?.is_none() {
            return Err(EnrollmentFailure::NoFace);
        }

        let file = format!("{}/face_{}.png", person_dir(person_id), safe_segment(enrollment_id));
        let path = self.root.join(&file);
        let png = payload::encode_canonical(image).map_err(|e| EnrollmentFailure::Storage(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EnrollmentFailure::Storage(e.to_string()))?;
        }
        tokio::fs::write(&path, &png)
            .await
            .map_err(|e| EnrollmentFailure::Storage(e.to_string()))?;

        self.invalidate_cache()
            .await
            .map_err(|e| EnrollmentFailure::Storage(e.to_string()))?;
        tracing::info!(person = %person_id, file = %file, "corpus image added");
        Ok(BackendArtifact::CorpusFile(file))
    }

    pub async fn recognize_face(&self, image: &Arc<RgbImage>) -> Result<BackendMatch, BackendError> {
        let Some(probe) = self.analysis.embed_primary(image).await? else {
            return Ok(BackendMatch::NoFace);
        };
        let gallery = self.representations().await?;
        let candidates = self.enrolled(&gallery).await?;
        let Some(best) = nearest(&probe, &candidates, self.metric) else {
            tracing::info!(
                entries = gallery.len(),
                enrolled = candidates.len(),
                "corpus search found no candidates"
            );
            return Ok(BackendMatch::NoCandidates);
        };

        Ok(match self.policy.decide(best.distance) {
            MatchDecision::Accepted {
                confidence,
                distance,
                lenient,
            } => {
                if lenient {
                    tracing::warn!(person = %best.person_id, distance, "accepted by lenient fallback");
                }
                BackendMatch::Matched {
                    person_id: best.person_id,
                    confidence,
                    distance: Some(distance),
                    lenient,
                }
            }
            MatchDecision::Rejected { distance } => BackendMatch::NoMatch {
                best_distance: Some(distance),
            },
        })
    }

    /// Gallery entries backed by a successful enrollment of an active person,
    /// attributed to that person.
    async fn enrolled(&self, gallery: &[GalleryEntry]) -> Result<Vec<GalleryEntry>, BackendError> {
        let owners: HashMap<String, String> = self
            .store
            .successful_artifacts(BackendKind::Corpus)
            .await?
            .into_iter()
            .filter_map(|stored| match stored.artifact {
                BackendArtifact::CorpusFile(file) => Some((file, stored.person_id)),
                _ => None,
            })
            .collect();
        Ok(gallery
            .iter()
            .filter_map(|entry| {
                owners.get(&entry.source).map(|person_id| GalleryEntry {
                    person_id: person_id.clone(),
                    ..entry.clone()
                })
            })
            .collect())
    }

    /// Drop the in-memory and persisted representation caches.
    pub async fn invalidate_cache(&self) -> Result<(), BackendError> {
        let mut cache = self.cache.write().await;
        *cache = None;
        match tokio::fs::remove_file(self.cache_file()).await {
            Ok(()) => tracing::info!(file = %self.cache_file().display(), "representation cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn discard_artifact(&self, artifact: &BackendArtifact) -> Result<(), BackendError> {
        let BackendArtifact::CorpusFile(file) = artifact else {
            return Ok(());
        };
        match tokio::fs::remove_file(self.resolve(file)?).await {
            Ok(()) => tracing::info!(file = %file, "corpus image removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.invalidate_cache().await
    }

    /// Number of corpus images per person.
    pub async fn inventory(&self) -> Result<BTreeMap<String, usize>, BackendError> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .fold(BTreeMap::new(), |mut counts, (person, _)| {
                *counts.entry(person).or_insert(0) += 1;
                counts
            }))
    }

    /// `(person, relative file)` for every image in the corpus, sorted.
    async fn scan(&self) -> Result<Vec<(String, String)>, BackendError> {
        let mut files = Vec::new();
        let mut people = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(person_dir) = people.next_entry().await? {
            if !person_dir.file_type().await?.is_dir() {
                continue;
            }
            let dir = person_dir.file_name().to_string_lossy().into_owned();
            let Some(person) = person_from_dir(&dir) else {
                tracing::warn!(dir = %dir, "skipping corpus directory with an undecodable name");
                continue;
            };
            let mut entries = tokio::fs::read_dir(person_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() && is_image(&entry.path()) {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    files.push((person.clone(), format!("{dir}/{name}")));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// The gallery: memory first, then the persisted file, then a full rebuild.
    async fn representations(&self) -> Result<Arc<Vec<GalleryEntry>>, BackendError> {
        if let Some(gallery) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(gallery));
        }

        let mut cache = self.cache.write().await;
        if let Some(gallery) = cache.as_ref() {
            return Ok(Arc::clone(gallery));
        }

        let gallery = match self.load_persisted().await? {
            Some(gallery) => gallery,
            None => {
                let gallery = self.rebuild().await?;
                self.persist(&gallery).await?;
                gallery
            }
        };
        let gallery = Arc::new(gallery);
        *cache = Some(Arc::clone(&gallery));
        Ok(gallery)
    }

    async fn load_persisted(&self) -> Result<Option<Vec<GalleryEntry>>, BackendError> {
        let path = self.cache_file();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: Vec<Representation> = match serde_json::from_str(&text) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "discarding unreadable representation cache");
                return Ok(None);
            }
        };
        tracing::debug!(entries = stored.len(), "representation cache loaded");
        let model = self.analysis.model_version().to_string();
        Ok(Some(
            stored
                .into_iter()
                .map(|r| GalleryEntry {
                    person_id: r.person_id,
                    source: r.file,
                    embedding: Embedding {
                        values: r.values,
                        model_version: Some(model.clone()),
                    },
                })
                .collect(),
        ))
    }

    async fn rebuild(&self) -> Result<Vec<GalleryEntry>, BackendError> {
        let files = self.scan().await?;
        let mut gallery = Vec::with_capacity(files.len());
        for (person_id, file) in files {
            let bytes = tokio::fs::read(self.resolve(&file)?).await?;
            let image = match payload::decode_bytes(&bytes) {
                Ok(image) => Arc::new(image),
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping undecodable corpus image");
                    continue;
                }
            };
            match self.analysis.embed_primary(&image).await? {
                Some(embedding) => gallery.push(GalleryEntry {
                    person_id,
                    source: file,
                    embedding,
                }),
                None => tracing::warn!(file = %file, "skipping corpus image without a face"),
            }
        }
        tracing::info!(entries = gallery.len(), "representation cache rebuilt");
        Ok(gallery)
    }

    async fn persist(&self, gallery: &[GalleryEntry]) -> Result<(), BackendError> {
        let stored: Vec<Representation> = gallery
            .iter()
            .map(|e| Representation {
                person_id: e.person_id.clone(),
                file: e.source.clone(),
                values: e.embedding.values.clone(),
            })
            .collect();
        let json = serde_json::to_vec(&stored).map_err(|e| BackendError::Cache(e.to_string()))?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.cache_file(), json).await?;
        Ok(())
    }
}
