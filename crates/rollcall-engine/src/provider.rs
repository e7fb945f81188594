//! Remote face provider: detection, token comparison and faceset management.
//!
//! The HTTP client speaks the Face++ v3 form protocol; everything else in the
//! engine sees only the [`FaceProvider`] trait.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected provider response: {0}")]
    Response(String),
    #[error("provider credentials missing: {0}")]
    MissingCredentials(&'static str),
}

impl ProviderError {
    /// Failures of the link rather than of one request's content.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Response(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// How an image is handed to the provider.
#[derive(Debug, Clone)]
pub enum ProviderImage {
    Url(String),
    Base64(String),
    File { bytes: Vec<u8>, file_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRectangle {
    pub top: i32,
    pub left: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub face_token: String,
    #[serde(default, rename = "face_rectangle")]
    pub rectangle: Option<FaceRectangle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacesetDetail {
    pub faceset_token: String,
    #[serde(default)]
    pub outer_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub face_count: u32,
    #[serde(default)]
    pub face_tokens: Vec<String>,
}

#[async_trait]
pub trait FaceProvider: Send + Sync {
    /// Faces found in the image, in provider order.
    async fn detect(&self, image: &ProviderImage) -> Result<Vec<DetectedFace>, ProviderError>;

    /// Same-person confidence for two tokens, 0-100.
    async fn compare(&self, face_token1: &str, face_token2: &str) -> Result<f32, ProviderError>;

    /// Create a faceset and return its token.
    async fn create_faceset(&self, outer_id: Option<&str>) -> Result<String, ProviderError>;

    /// Add tokens to a faceset, returning how many were added.
    async fn add_to_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError>;

    /// Remove tokens from a faceset, returning how many were removed.
    async fn remove_from_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError>;

    async fn faceset_detail(&self, faceset_token: &str) -> Result<FacesetDetail, ProviderError>;
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

#[derive(Deserialize)]
struct CompareResponse {
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct CreateFacesetResponse {
    faceset_token: String,
}

#[derive(Deserialize)]
struct AddFaceResponse {
    #[serde(default)]
    face_added: u32,
}

#[derive(Deserialize)]
struct RemoveFaceResponse {
    #[serde(default)]
    face_removed: u32,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error_message: Option<String>,
}

/// Face++ v3 HTTP client.
pub struct FacePlusPlusClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl FacePlusPlusClient {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        api_secret: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingCredentials("api_key"))?;
        let api_secret = api_secret
            .filter(|s| !s.is_empty())
            .ok_or(ProviderError::MissingCredentials("api_secret"))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn credentials(&self) -> Vec<(&'static str, String)> {
        vec![
            ("api_key", self.api_key.clone()),
            ("api_secret", self.api_secret.clone()),
        ]
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        fields: Vec<(&'static str, String)>,
    ) -> Result<T, ProviderError> {
        let mut form = self.credentials();
        form.extend(fields);
        let response = self.client.post(self.url(path)).form(&form).send().await?;
        read_json(response).await
    }
}

/// Decode a provider response, turning error bodies into [`ProviderError::Api`].
async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(api_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::Response(format!("{e}: {body}")))
}

fn api_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error_message)
        .unwrap_or_else(|| body.to_string());
    ProviderError::Api { status, message }
}

#[async_trait]
impl FaceProvider for FacePlusPlusClient {
    async fn detect(&self, image: &ProviderImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let response: DetectResponse = match image {
            ProviderImage::Url(url) => self.post_form("detect", vec![("image_url", url.clone())]).await?,
            ProviderImage::Base64(data) => {
                self.post_form("detect", vec![("image_base64", data.clone())]).await?
            }
            ProviderImage::File { bytes, file_name } => {
                let form = Form::new()
                    .text("api_key", self.api_key.clone())
                    .text("api_secret", self.api_secret.clone())
                    .part("image_file", Part::bytes(bytes.clone()).file_name(file_name.clone()));
                let response = self.client.post(self.url("detect")).multipart(form).send().await?;
                read_json(response).await?
            }
        };
        tracing::debug!(faces = response.faces.len(), "provider detect");
        Ok(response.faces)
    }

    async fn compare(&self, face_token1: &str, face_token2: &str) -> Result<f32, ProviderError> {
        let response: CompareResponse = self
            .post_form(
                "compare",
                vec![
                    ("face_token1", face_token1.to_string()),
                    ("face_token2", face_token2.to_string()),
                ],
            )
            .await?;
        // The provider omits confidence when either token holds no face.
        Ok(response.confidence.unwrap_or(0.0))
    }

    async fn create_faceset(&self, outer_id: Option<&str>) -> Result<String, ProviderError> {
        let fields = outer_id
            .map(|id| vec![("outer_id", id.to_string())])
            .unwrap_or_default();
        let response: CreateFacesetResponse = self.post_form("faceset/create", fields).await?;
        tracing::info!(faceset = %response.faceset_token, "faceset created");
        Ok(response.faceset_token)
    }

    async fn add_to_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError> {
        let response: AddFaceResponse = self
            .post_form(
                "faceset/addface",
                vec![
                    ("faceset_token", faceset_token.to_string()),
                    ("face_tokens", face_tokens.join(",")),
                ],
            )
            .await?;
        Ok(response.face_added)
    }

    async fn remove_from_faceset(&self, faceset_token: &str, face_tokens: &[String]) -> Result<u32, ProviderError> {
        let response: RemoveFaceResponse = self
            .post_form(
                "faceset/removeface",
                vec![
                    ("faceset_token", faceset_token.to_string()),
                    ("face_tokens", face_tokens.join(",")),
                ],
            )
            .await?;
        Ok(response.face_removed)
    }

    async fn faceset_detail(&self, faceset_token: &str) -> Result<FacesetDetail, ProviderError> {
        self.post_form(
            "faceset/getdetail",
            vec![("faceset_token", faceset_token.to_string())],
        )
        .await
    }
}
