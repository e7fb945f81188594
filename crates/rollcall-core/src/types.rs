use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit length.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => self.cosine_distance(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self
                .l2_normalized()
                .euclidean_distance(&other.l2_normalized()),
        }
    }
}

/// Distance function used to compare a probe against stored embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        })
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" | "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// One searchable embedding and the person it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: String,
    /// Where the embedding came from: an enrollment id or a corpus file path.
    pub source: String,
    pub embedding: Embedding,
}

/// Closest gallery entry to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestMatch {
    pub person_id: String,
    pub source: String,
    pub distance: f32,
    /// Number of gallery entries that were actually compared.
    pub candidates: usize,
}

/// Scan the whole gallery and return the entry with the smallest distance.
///
/// Entries whose dimension differs from the probe are skipped; returns `None`
/// when nothing comparable is left.
pub fn nearest(
    probe: &Embedding,
    gallery: &[GalleryEntry],
    metric: DistanceMetric,
) -> Option<NearestMatch> {
    let mut best: Option<(usize, f32)> = None;
    let mut compared = 0usize;

    for (i, entry) in gallery.iter().enumerate() {
        if entry.embedding.dim() != probe.dim() {
            tracing::debug!(
                source = %entry.source,
                expected = probe.dim(),
                actual = entry.embedding.dim(),
                "skipping gallery entry with mismatched dimension"
            );
            continue;
        }
        compared += 1;

        let distance = probe.distance(&entry.embedding, metric);
        tracing::debug!(person = %entry.person_id, source = %entry.source, distance, "candidate");
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }

    best.map(|(i, distance)| NearestMatch {
        person_id: gallery[i].person_id.clone(),
        source: gallery[i].source.clone(),
        distance,
        candidates: compared,
    })
}

/// Threshold rule turning a distance into an accept/reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Largest distance still accepted as the same person.
    pub threshold: f32,
    /// Accept the best candidate even above the threshold, with clamped confidence.
    /// Trades precision for availability; off unless configured.
    #[serde(default)]
    pub lenient_fallback: bool,
}

/// Confidence bounds applied when the lenient fallback accepts a candidate.
pub const LENIENT_CONFIDENCE_RANGE: (f32, f32) = (0.1, 0.9);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    Accepted {
        confidence: f32,
        distance: f32,
        /// True when only the lenient fallback let this candidate through.
        lenient: bool,
    },
    Rejected {
        distance: f32,
    },
}

impl MatchPolicy {
    pub fn strict(threshold: f32) -> Self {
        Self {
            threshold,
            lenient_fallback: false,
        }
    }

    /// `1 - distance / threshold`, not clamped.
    fn raw_confidence(&self, distance: f32) -> f32 {
        if self.threshold > 0.0 {
            1.0 - distance / self.threshold
        } else if distance <= 0.0 {
            1.0
        } else {
            0.0
        }
    }

    pub fn decide(&self, distance: f32) -> MatchDecision {
        if distance <= self.threshold {
            MatchDecision::Accepted {
                confidence: self.raw_confidence(distance).clamp(0.0, 1.0),
                distance,
                lenient: false,
            }
        } else if self.lenient_fallback {
            let (lo, hi) = LENIENT_CONFIDENCE_RANGE;
            MatchDecision::Accepted {
                confidence: self.raw_confidence(distance).clamp(lo, hi),
                distance,
                lenient: true,
            }
        } else {
            MatchDecision::Rejected { distance }
        }
    }
}
