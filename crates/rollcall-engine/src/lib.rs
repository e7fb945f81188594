//! rollcall-engine: face-identity resolution and attendance sessions.
//!
//! [`AttendanceService`] wires one [`IdentityBackend`] (corpus search, stored
//! embeddings, or a remote face provider) into the enrollment and recognition
//! pipelines and the attendance session engine.

pub mod attendance;
pub mod backend;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod provider;
pub mod recognition;
pub mod service;

pub use attendance::{
    AttendanceEngine, AttendanceMark, AttendanceReport, AttendanceResult, CleanupReport, MarkStatus, PresentEntry,
};
pub use backend::{BackendMatch, IdentityBackend, Screening};
pub use config::{Config, ConfigError};
pub use enrollment::{BatchEnrollment, BatchFailure, EnrollmentPipeline, RemovedEnrollment};
pub use error::{BackendError, EngineError, EnrollmentFailure};
pub use provider::{FacePlusPlusClient, FaceProvider, ProviderError, ProviderImage};
pub use recognition::{RecognitionOutcome, RecognitionPipeline, RecognitionReport};
pub use service::AttendanceService;
