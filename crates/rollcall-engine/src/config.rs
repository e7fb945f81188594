use rollcall_core::{DistanceMetric, MatchPolicy, QualityGate};
use rollcall_store::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration: TOML file first, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for the database, media and corpus when not set individually.
    pub data_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub corpus_dir: Option<PathBuf>,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// The single identity backend active in this deployment.
    pub backend: BackendKind,
    pub quality: QualityConfig,
    pub corpus: MatcherConfig,
    pub vector: MatcherConfig,
    pub remote: RemoteConfig,
    pub timeouts: TimeoutConfig,
    pub attendance: AttendanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_side: u32,
    pub min_sharpness: f64,
    /// Run the quality gate before recognition and report failures as rejections.
    pub gate_recognition: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub metric: DistanceMetric,
    pub threshold: f32,
    #[serde(default)]
    pub lenient_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Faceset that enrolled face tokens are added to, if any.
    pub faceset_token: Option<String>,
    /// Minimum compare score (0-100, exclusive) for a match.
    pub threshold: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub detect_secs: u64,
    pub embed_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    /// Present/late records older than this are removed by the cleanup job.
    pub cleanup_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            data_dir,
            db_path: None,
            media_dir: None,
            corpus_dir: None,
            model_dir: rollcall_core::default_model_dir(),
            backend: BackendKind::Corpus,
            quality: QualityConfig::default(),
            corpus: MatcherConfig::corpus_default(),
            vector: MatcherConfig::vector_default(),
            remote: RemoteConfig::default(),
            timeouts: TimeoutConfig::default(),
            attendance: AttendanceConfig::default(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        let gate = QualityGate::default();
        Self {
            min_side: gate.min_side,
            min_sharpness: gate.min_sharpness,
            gate_recognition: true,
        }
    }
}

impl MatcherConfig {
    /// Cosine distance 0.6, the usual ArcFace operating point.
    pub fn corpus_default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
            threshold: 0.6,
            lenient_fallback: false,
        }
    }

    /// L2-normalized Euclidean 1.13, equivalent to cosine similarity ≈ 0.36.
    pub fn vector_default() -> Self {
        Self {
            metric: DistanceMetric::EuclideanL2,
            threshold: 1.13,
            lenient_fallback: false,
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.threshold,
            lenient_fallback: self.lenient_fallback,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api-us.faceplusplus.com/facepp/v3".to_string(),
            api_key: None,
            api_secret: None,
            faceset_token: None,
            threshold: 80.0,
            timeout_secs: 15,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            detect_secs: 15,
            embed_secs: 30,
        }
    }
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self { cleanup_hours: 15 }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROLLCALL_*` variables, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let env = Env(&var);

        self.data_dir = env.path("ROLLCALL_DATA_DIR", &self.data_dir);
        self.db_path = env.opt_path("ROLLCALL_DB_PATH", self.db_path.take());
        self.media_dir = env.opt_path("ROLLCALL_MEDIA_DIR", self.media_dir.take());
        self.corpus_dir = env.opt_path("ROLLCALL_CORPUS_DIR", self.corpus_dir.take());
        self.model_dir = env.path("ROLLCALL_MODEL_DIR", &self.model_dir);
        self.backend = env.parsed("ROLLCALL_BACKEND", self.backend);

        self.quality.min_side = env.parsed("ROLLCALL_MIN_SIDE", self.quality.min_side);
        self.quality.min_sharpness = env.parsed("ROLLCALL_MIN_SHARPNESS", self.quality.min_sharpness);
        self.quality.gate_recognition = env.flag("ROLLCALL_GATE_RECOGNITION", self.quality.gate_recognition);

        self.corpus.metric = env.parsed("ROLLCALL_CORPUS_METRIC", self.corpus.metric);
        self.corpus.threshold = env.parsed("ROLLCALL_CORPUS_THRESHOLD", self.corpus.threshold);
        self.corpus.lenient_fallback = env.flag("ROLLCALL_CORPUS_LENIENT", self.corpus.lenient_fallback);
        self.vector.metric = env.parsed("ROLLCALL_VECTOR_METRIC", self.vector.metric);
        self.vector.threshold = env.parsed("ROLLCALL_VECTOR_THRESHOLD", self.vector.threshold);
        self.vector.lenient_fallback = env.flag("ROLLCALL_VECTOR_LENIENT", self.vector.lenient_fallback);

        self.remote.endpoint = env.string("ROLLCALL_REMOTE_ENDPOINT", &self.remote.endpoint);
        self.remote.api_key = env.opt_string("ROLLCALL_REMOTE_API_KEY", self.remote.api_key.take());
        self.remote.api_secret = env.opt_string("ROLLCALL_REMOTE_API_SECRET", self.remote.api_secret.take());
        self.remote.faceset_token = env.opt_string("ROLLCALL_REMOTE_FACESET", self.remote.faceset_token.take());
        self.remote.threshold = env.parsed("ROLLCALL_REMOTE_THRESHOLD", self.remote.threshold);
        self.remote.timeout_secs = env.parsed("ROLLCALL_REMOTE_TIMEOUT_SECS", self.remote.timeout_secs);

        self.timeouts.detect_secs = env.parsed("ROLLCALL_DETECT_TIMEOUT_SECS", self.timeouts.detect_secs);
        self.timeouts.embed_secs = env.parsed("ROLLCALL_EMBED_TIMEOUT_SECS", self.timeouts.embed_secs);
        self.attendance.cleanup_hours = env.parsed("ROLLCALL_CLEANUP_HOURS", self.attendance.cleanup_hours);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, matcher) in [("corpus", &self.corpus), ("vector", &self.vector)] {
            if !(matcher.threshold.is_finite() && matcher.threshold > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} threshold must be positive, got {}",
                    matcher.threshold
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.remote.threshold) {
            return Err(ConfigError::Invalid(format!(
                "remote threshold must be within 0-100, got {}",
                self.remote.threshold
            )));
        }
        if self.timeouts.detect_secs == 0 || self.timeouts.embed_secs == 0 || self.remote.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least one second".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("rollcall.db"))
    }

    pub fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.corpus_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("corpus"))
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate {
            min_side: self.quality.min_side,
            min_sharpness: self.quality.min_sharpness,
        }
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.detect_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.embed_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }
}

/// Typed lookups over an environment source; unparsable values keep the default.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.raw(key) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %value, "ignoring unparsable environment override");
                default
            }),
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.raw(key)
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(default)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn opt_string(&self, key: &str, default: Option<String>) -> Option<String> {
        self.raw(key).or(default)
    }

    fn path(&self, key: &str, default: &Path) -> PathBuf {
        self.raw(key).map(PathBuf::from).unwrap_or_else(|| default.to_path_buf())
    }

    fn opt_path(&self, key: &str, default: Option<PathBuf>) -> Option<PathBuf> {
        self.raw(key).map(PathBuf::from).or(default)
    }
}
