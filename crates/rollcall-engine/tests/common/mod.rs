//! Shared fixtures: a deterministic pattern analyzer, an in-memory face
//! provider, synthetic face images, and a service builder.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{Rgb, RgbImage};
use rollcall_core::{payload, AnalyzerError, BoundingBox, Embedding, FaceAnalyzer, ImagePayload};
use rollcall_engine::provider::{DetectedFace, FacesetDetail};
use rollcall_engine::{AttendanceService, Config, FaceProvider, IdentityBackend, ProviderError, ProviderImage};
use rollcall_store::{BackendKind, Class, NewClass, NewPerson, Store};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Pairwise 8 bits apart, so their embeddings are orthogonal.
pub const FACE_A: u16 = 0x00FF;
pub const FACE_B: u16 = 0x0F0F;
pub const FACE_C: u16 = 0x3333;
pub const FACE_D: u16 = 0x5555;

const MARKER: Rgb<u8> = Rgb([0, 0, 255]);

/// A 4x4 grid of bright/dark cells chosen by the bits of `code`, with a fine
/// checker texture so the image is sharp.
pub fn face_image_sized(code: u16, width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let cell = (y * 4 / height) * 4 + (x * 4 / width);
        let base: i32 = if code >> cell & 1 == 1 { 200 } else { 60 };
        let texture = if (x / 2 + y / 2) % 2 == 0 { 40 } else { -40 };
        let v = (base + texture).clamp(0, 255) as u8;
        Rgb([v, v, v])
    })
}

pub fn face_image(code: u16) -> RgbImage {
    face_image_sized(code, 128, 128)
}

/// Same face with a marker pixel the analyzer reads as a second face.
pub fn two_face_image(code: u16) -> RgbImage {
    let mut image = face_image(code);
    image.put_pixel(0, 0, MARKER);
    image
}

pub fn blank_image() -> RgbImage {
    RgbImage::new(128, 128)
}

/// A face-sized, featureless image: one face, no sharpness.
pub fn blurry_image() -> RgbImage {
    RgbImage::from_pixel(128, 128, Rgb([130, 130, 130]))
}

pub fn png(image: &RgbImage) -> ImagePayload {
    ImagePayload::Binary(payload::encode_canonical(image).unwrap())
}

pub fn data_url(image: &RgbImage) -> ImagePayload {
    let encoded = STANDARD.encode(payload::encode_canonical(image).unwrap());
    ImagePayload::Encoded(format!("data:image/png;base64,{encoded}"))
}

fn mean_luma(image: &RgbImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f32 {
    let mut sum = 0f64;
    let mut n = 0f64;
    for y in y0..y1 {
        for x in x0..x1 {
            let p = image.get_pixel(x, y);
            sum += (p[0] as f64 + p[1] as f64 + p[2] as f64) / 3.0;
            n += 1.0;
        }
    }
    if n == 0.0 {
        0.0
    } else {
        (sum / n) as f32
    }
}

/// Reads the synthetic images above: a black image has no face, a marker
/// pixel adds a second face, and the embedding is the 4x4 cell means minus
/// the global mean.
#[derive(Default)]
pub struct PatternAnalyzer {
    pub embed_calls: AtomicUsize,
    /// When set, embedding fails as a broken model would.
    pub fail_embed: AtomicBool,
    /// Milliseconds each embedding blocks for, as a slow model would.
    pub embed_delay_ms: AtomicU64,
}

impl FaceAnalyzer for PatternAnalyzer {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        if image.pixels().all(|p| p.0 == [0, 0, 0]) {
            return Ok(Vec::new());
        }
        let face = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 0.99,
            landmarks: None,
        };
        if *image.get_pixel(0, 0) == MARKER {
            let second = BoundingBox {
                confidence: 0.5,
                ..face.clone()
            };
            return Ok(vec![face, second]);
        }
        Ok(vec![face])
    }

    fn embed(&self, image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.embed_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_embed.load(Ordering::SeqCst) {
            return Err(AnalyzerError::Recognizer("model output malformed".into()));
        }
        let (w, h) = image.dimensions();
        let global = mean_luma(image, 0, 0, w, h);
        let mut values = Vec::with_capacity(16);
        for row in 0..4 {
            for col in 0..4 {
                let cell = mean_luma(image, col * w / 4, row * h / 4, (col + 1) * w / 4, (row + 1) * h / 4);
                values.push(cell - global);
            }
        }
        Ok(Embedding::new(values))
    }

    fn model_version(&self) -> &str {
        "pattern-v1"
    }
}

/// In-memory Face++ stand-in built on the pattern analyzer.
#[derive(Default)]
pub struct MockProvider {
    analyzer: PatternAnalyzer,
    tokens: Mutex<HashMap<String, Embedding>>,
    facesets: Mutex<HashMap<String, Vec<String>>>,
    next: AtomicUsize,
    /// When set, every call fails as if the provider were unreachable.
    pub offline: AtomicBool,
    /// Milliseconds every call waits before answering.
    pub delay_ms: AtomicU64,
    pub detect_calls: AtomicUsize,
    pub compare_calls: AtomicUsize,
}

impl MockProvider {
    async fn check_link(&self) -> Result<(), ProviderError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        Ok(())
    }

    pub fn faceset_tokens(&self, faceset: &str) -> Vec<String> {
        self.facesets
            .lock()
            .unwrap()
            .get(faceset)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl FaceProvider for MockProvider {
    async fn detect(&self, image: &ProviderImage) -> Result<Vec<DetectedFace>, ProviderError> {
        self.check_link().await?;
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let ProviderImage::Base64(encoded) = image else {
            return Err(ProviderError::Api {
                status: 400,
                message: "unsupported image source".into(),
            });
        };
        let image = payload::decode(&ImagePayload::Encoded(encoded.clone()))
            .map_err(|e| ProviderError::Api {
                status: 400,
                message: e.to_string(),
            })?;
        let faces = self.analyzer.detect(&image).unwrap();
        let mut detected = Vec::new();
        for face in &faces {
            let embedding = self.analyzer.embed(&image, face).unwrap();
            let token = format!("tok-{}", self.next.fetch_add(1, Ordering::SeqCst));
            self.tokens.lock().unwrap().insert(token.clone(), embedding);
            detected.push(DetectedFace {
                face_token: token,
                rectangle: None,
            });
        }
        Ok(detected)
    }

    async fn compare(&self, face_token1: &str, face_token2: &str) -> Result<f32, ProviderError> {
        self.check_link().await?;
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.tokens.lock().unwrap();
        let (Some(a), Some(b)) = (tokens.get(face_token1), tokens.get(face_token2)) else {
            return Err(ProviderError::Api {
                status: 400,
                message: "INVALID_FACE_TOKEN".into(),
            });
        };
        Ok(100.0 * (1.0 - a.cosine_distance(b) / 2.0))
    }

    async fn create_faceset(&self, outer_id: Option<&str>) -> Result<String, ProviderError> {
        self.check_link().await?;
        let token = format!("fs-{}", outer_id.unwrap_or("anon"));
        self.facesets.lock().unwrap().entry(token.clone()).or_default();
        Ok(token)
    }

    async fn add_to_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError> {
        self.check_link().await?;
        let mut facesets = self.facesets.lock().unwrap();
        let set = facesets.entry(faceset_token.to_string()).or_default();
        set.extend(face_tokens.iter().cloned());
        Ok(face_tokens.len() as u32)
    }

    async fn remove_from_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError> {
        self.check_link().await?;
        let mut facesets = self.facesets.lock().unwrap();
        let set = facesets.entry(faceset_token.to_string()).or_default();
        let before = set.len();
        set.retain(|t| !face_tokens.contains(t));
        Ok((before - set.len()) as u32)
    }

    async fn faceset_detail(&self, faceset_token: &str) -> Result<FacesetDetail, ProviderError> {
        self.check_link().await?;
        let tokens = self.faceset_tokens(faceset_token);
        Ok(FacesetDetail {
            faceset_token: faceset_token.to_string(),
            outer_id: None,
            display_name: None,
            face_count: tokens.len() as u32,
            face_tokens: tokens,
        })
    }
}

pub struct Harness {
    pub service: AttendanceService,
    pub analyzer: Arc<PatternAnalyzer>,
    pub provider: Arc<MockProvider>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir, backend: BackendKind) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.model_dir = dir.path().join("models");
    config.backend = backend;
    config.remote.faceset_token = Some("fs-main".into());
    config
}

pub async fn harness_with(backend: BackendKind, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, backend);
    tweak(&mut config);
    let store = Store::open_in_memory().await.unwrap();
    let analyzer = Arc::new(PatternAnalyzer::default());
    let provider = Arc::new(MockProvider::default());
    let backend = IdentityBackend::from_config(
        &config,
        store.clone(),
        Some(analyzer.clone() as Arc<dyn FaceAnalyzer>),
        Some(provider.clone() as Arc<dyn FaceProvider>),
    )
    .unwrap();
    Harness {
        service: AttendanceService::new(config, store, backend),
        analyzer,
        provider,
        dir,
    }
}

pub async fn harness(backend: BackendKind) -> Harness {
    harness_with(backend, |_| {}).await
}

/// A class with the given people on its roster.
pub async fn class_with(service: &AttendanceService, code: &str, people: &[&str]) -> Class {
    let class = service
        .create_class(NewClass {
            code: code.into(),
            name: format!("{code} lecture"),
            instructor: Some("dr-okafor".into()),
        })
        .await
        .unwrap();
    for id in people {
        service
            .create_person(NewPerson {
                id: id.to_string(),
                display_name: id.to_uppercase(),
                class_ids: vec![class.id.clone()],
            })
            .await
            .unwrap();
    }
    class
}

pub async fn person(service: &AttendanceService, id: &str) {
    service
        .create_person(NewPerson {
            id: id.into(),
            display_name: id.to_uppercase(),
            class_ids: Vec::new(),
        })
        .await
        .unwrap();
}
