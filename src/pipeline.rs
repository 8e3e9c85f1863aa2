use crate::category::CategoryIndex;
use crate::compliance::{self, ComplianceResult, SkinToneDetector, SubjectDetector};
use crate::events::{NotifyEvent, NotifySink};
use crate::extract::{
    ATTR_BRAND, ATTR_ITEM_TYPE, ATTR_SIZE, Extraction, Extractor, make_listing_title,
};
use crate::models::{
    ComplianceReport, Draft, DraftPhoto, DraftRequest, DraftResponse, DraftStatus, StageReport,
};
use crate::ocr::{NullRecognizer, OcrClient, OcrConfig, TextRecognizer};
use crate::photo::Photo;
use crate::pricing::{CompsQuery, HttpCompsSource, PriceEstimator, PricingConfig, PricingConfigHandle};
use crate::store::{DraftStore, MediaCleanup, MediaStore, MemoryDraftStore, MemoryMediaStore};
use chrono::Utc;
use serde_json::{Value, json};
use std::{env, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const DEFAULT_CONDITION: &str = "good";

#[derive(Clone)]
pub struct Pipeline {
    detector: Arc<dyn SubjectDetector>,
    extractor: Arc<Extractor>,
    categories: Arc<CategoryIndex>,
    estimator: Arc<PriceEstimator>,
    drafts: Arc<dyn DraftStore>,
    media: Arc<dyn MediaStore>,
    notify: NotifySink,
    permits: Arc<Semaphore>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Arc<dyn SubjectDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        categories: Arc<CategoryIndex>,
        estimator: Arc<PriceEstimator>,
        drafts: Arc<dyn DraftStore>,
        media: Arc<dyn MediaStore>,
        notify: NotifySink,
    ) -> Self {
        Self {
            detector,
            extractor: Arc::new(Extractor::new(recognizer)),
            categories,
            estimator,
            drafts,
            media,
            notify,
            permits: Arc::new(Semaphore::new(worker_permits_from_env())),
        }
    }

    /// Default wiring: env-configured collaborators, in-memory storage.
    pub fn from_env(notify: NotifySink) -> Self {
        let ocr_config = OcrConfig::from_env();
        let recognizer: Arc<dyn TextRecognizer> = if ocr_config.gateway_url.is_empty() {
            Arc::new(NullRecognizer)
        } else {
            Arc::new(OcrClient::new(ocr_config))
        };
        let estimator = Arc::new(PriceEstimator::new(
            Arc::new(HttpCompsSource::from_env()),
            PricingConfigHandle::new(PricingConfig::from_env()),
        ));
        Self::new(
            Arc::new(SkinToneDetector::default()),
            recognizer,
            Arc::new(CategoryIndex::load()),
            estimator,
            Arc::new(MemoryDraftStore::default()),
            Arc::new(MemoryMediaStore::default()),
            notify,
        )
    }

    pub fn drafts(&self) -> &Arc<dyn DraftStore> {
        &self.drafts
    }

    pub fn estimator(&self) -> &Arc<PriceEstimator> {
        &self.estimator
    }

    pub fn categories(&self) -> &Arc<CategoryIndex> {
        &self.categories
    }

    pub fn notify(&self) -> &NotifySink {
        &self.notify
    }

    /// Runs the full ingestion pipeline: compliance gate, media persistence,
    /// attribute extraction, category ranking, price estimation, assembly.
    /// Every draft is stored, including fully rejected ones.
    pub async fn build_draft(&self, request: DraftRequest) -> Result<DraftResponse, PipelineError> {
        if request.photos.len() > max_photos_allowed() {
            return Err(PipelineError::invalid_input(
                "compliance_gate",
                "too_many_photos",
            ));
        }

        let draft_id = Uuid::new_v4();
        let mut stages = Vec::new();

        let (accepted, reports) = self
            .capture_stage("compliance_gate", &mut stages, self.run_gate(&request))
            .await?;

        for report in reports.iter().filter(|r| !r.accepted) {
            if let Some(reason) = report.reason {
                self.notify.emit(NotifyEvent::PhotoRejected {
                    draft_id: draft_id.to_string(),
                    filename: report.filename.clone(),
                    reason,
                });
            }
        }

        if accepted.is_empty() {
            let draft = self.assemble_rejected(draft_id, &request, reports);
            self.drafts
                .put(draft.clone())
                .await
                .map_err(|err| PipelineError::internal("persist_draft", err.to_string()))?;
            self.notify.emit(NotifyEvent::DraftRejected {
                draft_id: draft_id.to_string(),
            });
            let started = Instant::now();
            stages.push(StageReport::new(
                "assemble_draft",
                started.elapsed().as_millis(),
                json!({ "status": draft.status.as_str(), "photos": 0 }),
            ));
            return Ok(DraftResponse { draft, stages });
        }

        let mut cleanup = MediaCleanup::new(Arc::clone(&self.media));
        let photos = self
            .capture_stage("persist_media", &mut stages, {
                let media = Arc::clone(&self.media);
                let accepted = accepted.clone();
                let cleanup = &mut cleanup;
                async move {
                    let mut persisted = Vec::with_capacity(accepted.len());
                    for (position, photo) in accepted.iter().enumerate() {
                        let media_key = media
                            .persist(draft_id, photo)
                            .await
                            .map_err(|err| {
                                PipelineError::internal("persist_media", err.to_string())
                            })?;
                        cleanup.track(media_key.clone());
                        persisted.push(DraftPhoto {
                            filename: photo.filename.clone(),
                            width: photo.width,
                            height: photo.height,
                            media_key,
                            position,
                        });
                    }
                    let count = persisted.len();
                    Ok(StageOutcome::new(persisted, json!({ "count": count })))
                }
            })
            .await?;

        let extraction = self
            .capture_stage("extract_attributes", &mut stages, {
                let extractor = Arc::clone(&self.extractor);
                let accepted = accepted.clone();
                let hints = request.hints.clone();
                async move {
                    let extraction = extractor.extract(&accepted, &hints).await;
                    let output = json!({
                        "attributes": extraction.attributes,
                        "recognized_chars": extraction.recognized_text.len(),
                    });
                    Ok(StageOutcome::new(extraction, output))
                }
            })
            .await?;

        let category = self
            .capture_stage("rank_categories", &mut stages, {
                let categories = Arc::clone(&self.categories);
                let hint_text = hint_blob(&request);
                let extracted_text = extraction_blob(&extraction);
                let cover = accepted.first().map(|p| p.filename.clone());
                async move {
                    let ranked = categories.rank(
                        hint_text.as_deref(),
                        Some(&extracted_text),
                        cover.as_deref(),
                    );
                    let top = ranked.first().cloned();
                    Ok(StageOutcome::new(top, json!({ "candidates": ranked })))
                }
            })
            .await?;

        let price = self
            .capture_stage("estimate_price", &mut stages, {
                let estimator = Arc::clone(&self.estimator);
                let category = category.clone();
                let brand = extraction.attributes.get(ATTR_BRAND).map(|g| g.value.clone());
                let size = extraction.attributes.get(ATTR_SIZE).map(|g| g.value.clone());
                let condition = condition_of(&request);
                async move {
                    let Some(category) = category else {
                        return Ok(StageOutcome::new(None, json!({ "skipped": "no_category" })));
                    };
                    let query = CompsQuery::new(
                        brand.as_deref().unwrap_or(""),
                        &category.category_id,
                        size.as_deref().unwrap_or(""),
                        &condition,
                    );
                    let estimate = estimator.estimate(&query).await;
                    Ok(StageOutcome::new(
                        Some(estimate),
                        json!({ "estimate": estimate, "category": category.category_id }),
                    ))
                }
            })
            .await?;

        let draft = self
            .capture_stage("assemble_draft", &mut stages, {
                let extraction = extraction.clone();
                let category = category.clone();
                let reports = reports.clone();
                let request = request.clone();
                async move {
                    let title = make_listing_title(
                        extraction.attributes.get(ATTR_BRAND).map(|g| g.value.as_str()),
                        extraction.attributes.get(ATTR_ITEM_TYPE).map(|g| g.value.as_str()),
                        extraction
                            .attributes
                            .get(crate::extract::ATTR_COLOUR)
                            .map(|g| g.value.as_str()),
                        extraction.attributes.get(ATTR_SIZE).map(|g| g.value.as_str()),
                    );
                    let condition = condition_of(&request);
                    let description = request
                        .hints
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("{title}. Condition: {condition}."));
                    let now = Utc::now();
                    let draft = Draft {
                        id: draft_id,
                        created_at: now,
                        updated_at: now,
                        // `ready` is a caller decision made through the
                        // update interface, never assigned by ingestion.
                        status: DraftStatus::Draft,
                        title: Some(title),
                        description: Some(description),
                        condition,
                        attributes: extraction.attributes,
                        category,
                        price,
                        selected_price: None,
                        photos,
                        compliance: reports,
                    };
                    let output = json!({
                        "status": draft.status.as_str(),
                        "photos": draft.photos.len(),
                        "category": draft.category.as_ref().map(|c| c.category_id.clone()),
                    });
                    Ok(StageOutcome::new(draft, output))
                }
            })
            .await?;

        self.drafts
            .put(draft.clone())
            .await
            .map_err(|err| PipelineError::internal("persist_draft", err.to_string()))?;
        cleanup.disarm();

        Ok(DraftResponse { draft, stages })
    }

    /// Concurrent per-photo compliance, bounded by the worker semaphore.
    /// Results come back in submission order regardless of completion order.
    async fn run_gate(
        &self,
        request: &DraftRequest,
    ) -> Result<StageOutcome<(Vec<Photo>, Vec<ComplianceReport>)>, PipelineError> {
        let mut handles = Vec::with_capacity(request.photos.len());
        for upload in &request.photos {
            let photo = Photo::from_upload(upload);
            let detector = Arc::clone(&self.detector);
            let permits = Arc::clone(&self.permits);
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                let verdict = compliance::evaluate(&photo, detector.as_ref());
                (photo, verdict)
            }));
        }

        let mut accepted = Vec::new();
        let mut reports = Vec::new();
        for handle in handles {
            let (photo, verdict) = handle
                .await
                .map_err(|err| PipelineError::internal("compliance_gate", err.to_string()))?;
            match verdict {
                ComplianceResult::Accepted => {
                    reports.push(ComplianceReport {
                        filename: photo.filename.clone(),
                        accepted: true,
                        reason: None,
                    });
                    accepted.push(photo);
                }
                ComplianceResult::Rejected(reason) => {
                    reports.push(ComplianceReport {
                        filename: photo.filename.clone(),
                        accepted: false,
                        reason: Some(reason),
                    });
                }
            }
        }

        let output = json!({
            "submitted": reports.len(),
            "accepted": accepted.len(),
            "reports": reports,
        });
        Ok(StageOutcome::new((accepted, reports), output))
    }

    fn assemble_rejected(
        &self,
        draft_id: Uuid,
        request: &DraftRequest,
        reports: Vec<ComplianceReport>,
    ) -> Draft {
        let now = Utc::now();
        Draft {
            id: draft_id,
            created_at: now,
            updated_at: now,
            status: DraftStatus::Rejected,
            title: None,
            description: None,
            condition: condition_of(request),
            attributes: Default::default(),
            category: None,
            price: None,
            selected_price: None,
            photos: Vec::new(),
            compliance: reports,
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn condition_of(request: &DraftRequest) -> String {
    request
        .hints
        .condition
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CONDITION.to_string())
}

fn hint_blob(request: &DraftRequest) -> Option<String> {
    let parts: Vec<&str> = [
        request.hints.brand.as_deref(),
        request.hints.size.as_deref(),
        request.hints.colour.as_deref(),
        request.hints.description.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn extraction_blob(extraction: &Extraction) -> String {
    let mut blob = extraction.recognized_text.clone();
    for guess in extraction.attributes.values() {
        blob.push(' ');
        blob.push_str(&guess.value);
    }
    blob
}

fn worker_permits_from_env() -> usize {
    env::var("WORKER_PERMITS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
}

fn max_photos_allowed() -> usize {
    env::var("MAX_PHOTOS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(12)
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::models::{Hints, PhotoUpload};
    use crate::photo::testutil as photos;
    use crate::pricing::{CompsError, CompsSource};
    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    pub fn empty_draft() -> Draft {
        let now = Utc::now();
        Draft {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            status: DraftStatus::Draft,
            title: None,
            description: None,
            condition: DEFAULT_CONDITION.to_string(),
            attributes: Default::default(),
            category: None,
            price: None,
            selected_price: None,
            photos: Vec::new(),
            compliance: Vec::new(),
        }
    }

    pub fn upload_from(photo: &Photo) -> PhotoUpload {
        PhotoUpload {
            filename: photo.filename.clone(),
            width: photo.width,
            height: photo.height,
            pixels: BASE64.encode(&photo.pixels),
            byte_len: None,
        }
    }

    pub fn sharp_upload(filename: &str) -> PhotoUpload {
        let photo = photos::named(
            photos::checkerboard(260, 260, (20, 40, 90), (220, 220, 230)),
            filename,
        );
        upload_from(&photo)
    }

    pub struct FixedComps(pub Vec<i64>);

    #[async_trait]
    impl CompsSource for FixedComps {
        async fn lookup(&self, _query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
            Ok(self.0.clone())
        }
    }

    pub fn test_pipeline(comps: Vec<i64>) -> (Pipeline, Arc<MemoryMediaStore>) {
        let media = Arc::new(MemoryMediaStore::default());
        let estimator = Arc::new(PriceEstimator::new(
            Arc::new(FixedComps(comps)),
            PricingConfigHandle::new(PricingConfig::from_env()),
        ));
        let (notify, _worker) = NotifySink::spawn();
        let pipeline = Pipeline::new(
            Arc::new(SkinToneDetector::default()),
            Arc::new(NullRecognizer),
            Arc::new(CategoryIndex::load()),
            estimator,
            Arc::new(MemoryDraftStore::default()),
            media.clone(),
            notify,
        );
        (pipeline, media)
    }

    pub fn request(photos: Vec<PhotoUpload>, hints: Hints) -> DraftRequest {
        DraftRequest { photos, hints }
    }
}
