use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::category::CategoryCandidate;
use crate::compliance::RejectReason;
use crate::pricing::PriceEstimate;

/// Inbound payload for `POST /drafts`.
///
/// Photos arrive already decoded: raw RGB8 pixel buffers plus dimensions,
/// base64-encoded on the wire. Hints are optional caller guesses that merge
/// into extraction at the lowest precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftRequest {
    pub photos: Vec<PhotoUpload>,
    #[serde(default)]
    pub hints: Hints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoUpload {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// base64-encoded RGB8 buffer, `width * height * 3` bytes once decoded.
    pub pixels: String,
    /// Size of the original upload before decoding, when the caller knows it.
    #[serde(default)]
    pub byte_len: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hints {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DraftResponse {
    pub draft: Draft,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Ready,
    Posted,
    Rejected,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Ready => "ready",
            DraftStatus::Posted => "posted",
            DraftStatus::Rejected => "rejected",
        }
    }
}

/// Where a resolved attribute value came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeSource {
    RecognizedText,
    SlugMatch,
    CallerHint,
    Default,
}

impl AttributeSource {
    pub fn rank(&self) -> u8 {
        match self {
            AttributeSource::RecognizedText => 3,
            AttributeSource::SlugMatch => 2,
            AttributeSource::CallerHint => 1,
            AttributeSource::Default => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeGuess {
    pub value: String,
    pub confidence: f32,
    pub source: AttributeSource,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftPhoto {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub media_key: String,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub filename: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// The assembled, editable listing record produced by ingestion.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DraftStatus,
    pub title: Option<String>,
    pub description: Option<String>,
    pub condition: String,
    pub attributes: BTreeMap<String, AttributeGuess>,
    pub category: Option<CategoryCandidate>,
    pub price: Option<PriceEstimate>,
    pub selected_price: Option<i64>,
    pub photos: Vec<DraftPhoto>,
    pub compliance: Vec<ComplianceReport>,
}

impl Draft {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|guess| guess.value.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<DraftStatus>,
    #[serde(default)]
    pub selected_price: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
