use crate::http::build_client;
use crate::photo::Photo;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
}

impl OcrConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("OCR_GATEWAY_URL").unwrap_or_default(),
            api_key: std::env::var("OCR_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Text recognition over a photo. Implementations must be deterministic for
/// identical pixel input so the extraction pipeline stays reproducible.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn read_text(&self, photo: &Photo) -> Result<String, OcrError>;
}

/// Remote OCR gateway client. The gateway receives the raw RGB buffer and
/// returns the recognized text blocks joined into one string.
pub struct OcrClient {
    http: Client,
    config: OcrConfig,
}

impl OcrClient {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecognizeRequest {
    filename: String,
    width: u32,
    height: u32,
    pixels: String,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    blocks: Vec<TextBlock>,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    text: String,
}

#[async_trait]
impl TextRecognizer for OcrClient {
    async fn read_text(&self, photo: &Photo) -> Result<String, OcrError> {
        let gateway = self.config.gateway_url.trim();
        if gateway.is_empty() {
            return Err(OcrError::MissingGateway);
        }

        let body = RecognizeRequest {
            filename: photo.filename.clone(),
            width: photo.width,
            height: photo.height,
            pixels: BASE64.encode(&photo.pixels),
        };

        let mut request = self.http.post(format!("{gateway}/recognize")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| OcrError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(OcrError::Http(format!("HTTP {}", response.status())));
        }

        let payload: RecognizeResponse = response
            .json()
            .await
            .map_err(|err| OcrError::InvalidResponse(err.to_string()))?;

        Ok(payload
            .blocks
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Recognizer used when no gateway is configured: yields no text so the
/// extractor falls through to slug and hint sources.
pub struct NullRecognizer;

#[async_trait]
impl TextRecognizer for NullRecognizer {
    async fn read_text(&self, _photo: &Photo) -> Result<String, OcrError> {
        Ok(String::new())
    }
}
