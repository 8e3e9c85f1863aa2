mod category;
mod compliance;
mod events;
mod extract;
mod http;
mod idempotency;
mod jobs;
mod learning;
mod metrics;
mod models;
mod ocr;
mod photo;
mod pipeline;
mod pricing;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use events::{NotifyEvent, NotifySink};
use learning::{CorrectionLog, CorrectionRecord, CorrectionSource, LearningLoop, TeacherExample};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Draft, DraftRequest, DraftResponse, DraftStatus, DraftUpdate};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use pricing::{CompsQuery, PriceEstimate};
use security::{AuthContext, AuthState, require_api_auth};
use store::DraftStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "magpie.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let (notify, _notify_worker) = NotifySink::spawn();
    let pipeline = Pipeline::from_env(notify);
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let corrections = Arc::new(CorrectionLog::from_env());
    let learning = Arc::new(LearningLoop::new(
        Arc::clone(pipeline.estimator()),
        Arc::clone(&corrections),
    ));
    let openapi: serde_json::Value =
        serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        corrections,
        learning,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/drafts", post(create_draft))
        .route("/drafts/{id}", get(get_draft).put(update_draft))
        .route("/price/suggest", get(suggest_price))
        .route("/taxonomy/reload", post(reload_taxonomy))
        .route("/learning/run", post(run_learning))
        .nest(
            "/jobs",
            Router::new()
                .route("/drafts", post(enqueue_draft_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "magpie.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    corrections: Arc<CorrectionLog>,
    learning: Arc<LearningLoop>,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, DraftResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "magpie-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Magpie API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap_or_default()
}

// Pixel payloads are large; the default limit allows a dozen decoded photos.
fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

/// Run the photos → priced draft pipeline.
///
/// - Method: `POST`
/// - Path: `/drafts`
/// - Auth: `Authorization: Bearer <key>` or `X-Magpie-Key: <key>`
/// - Body: `DraftRequest`
/// - Response: `DraftResponse` (draft + per-stage transcript)
///
/// Supports `Idempotency-Key`: a replayed key returns the original response
/// without re-running the pipeline.
async fn create_draft(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<DraftRequest>,
) -> Result<Json<DraftResponse>, AppError> {
    crate::metrics::inc_requests("/drafts");
    info!(
        target = "magpie.api",
        seller = %context.seller_id,
        api_key = %context.api_key_id,
        photos = payload.photos.len(),
        "draft pipeline invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.pipeline.build_draft(payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.pipeline.build_draft(payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.pipeline.build_draft(payload).await?;
    Ok(Json(response))
}

async fn get_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Draft>, AppError> {
    crate::metrics::inc_requests("/drafts/{id}");
    let id = parse_draft_id(&id)?;
    let draft = state
        .pipeline
        .drafts()
        .get(id)
        .await
        .map_err(|_| AppError::NotFound("draft"))?;
    Ok(Json(draft))
}

async fn update_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DraftUpdate>,
) -> Result<Json<Draft>, AppError> {
    crate::metrics::inc_requests("/drafts/{id}");
    let id = parse_draft_id(&id)?;
    let draft =
        apply_draft_update(state.pipeline.drafts().as_ref(), &state.corrections, id, update)
            .await?;
    Ok(Json(draft))
}

/// Apply a caller edit to a stored draft.
///
/// A draft with no surviving photos can never leave `rejected`. Changing
/// `selected_price` away from the current selection is treated as a
/// correction and appended to the learning log.
async fn apply_draft_update(
    drafts: &dyn DraftStore,
    corrections: &CorrectionLog,
    id: uuid::Uuid,
    update: DraftUpdate,
) -> Result<Draft, AppError> {
    let mut draft = drafts.get(id).await.map_err(|_| AppError::NotFound("draft"))?;

    if let Some(status) = update.status
        && status != DraftStatus::Rejected
        && draft.photos.is_empty()
    {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "update_draft",
            "rejected_draft_has_no_photos",
        )));
    }

    if let Some(title) = update.title {
        draft.title = Some(title);
    }
    if let Some(description) = update.description {
        draft.description = Some(description);
    }
    if let Some(status) = update.status {
        draft.status = status;
    }
    if let Some(selected) = update.selected_price {
        if draft.selected_price != Some(selected) {
            record_price_correction(corrections, &draft, selected);
        }
        draft.selected_price = Some(selected);
    }
    draft.updated_at = Utc::now();

    drafts
        .put(draft.clone())
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("update_draft", err.to_string())))?;
    Ok(draft)
}

/// A user picking their own price is ground truth the estimator missed.
fn record_price_correction(corrections: &CorrectionLog, draft: &Draft, selected_pence: i64) {
    let Some(price) = draft.price else {
        return;
    };
    let Some(category) = draft.category.as_ref() else {
        return;
    };
    let record = CorrectionRecord {
        recorded_at: Utc::now(),
        source: CorrectionSource::UserEdit,
        category_id: category.category_id.clone(),
        condition: draft.condition.clone(),
        predicted_pence: price.mid_pence,
        truth_pence: selected_pence,
    };
    if let Err(err) = corrections.append(&record) {
        error!(target = "magpie.api", error = %err, "failed to log price correction");
    }
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    #[serde(default)]
    brand: String,
    category_id: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    condition: String,
}

/// Stand-alone price suggestion, same estimator the pipeline uses.
async fn suggest_price(
    State(state): State<AppState>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<PriceEstimate>, AppError> {
    crate::metrics::inc_requests("/price/suggest");
    let condition = if query.condition.trim().is_empty() {
        pipeline::DEFAULT_CONDITION
    } else {
        query.condition.as_str()
    };
    let comps_query = CompsQuery::new(&query.brand, &query.category_id, &query.size, condition);
    let estimate = state.pipeline.estimator().estimate(&comps_query).await;
    Ok(Json(estimate))
}

async fn reload_taxonomy(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/taxonomy/reload");
    let count = state.pipeline.categories().reload();
    Json(json!({ "categories": count }))
}

#[derive(Debug, Deserialize)]
struct LearningRunRequest {
    #[serde(default)]
    examples: Vec<TeacherExample>,
}

/// Trigger an offline learning pass over the supplied labeled sales plus the
/// accumulated correction log.
async fn run_learning(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<LearningRunRequest>,
) -> Result<Json<learning::LearningReport>, AppError> {
    crate::metrics::inc_requests("/learning/run");
    info!(
        target = "magpie.api",
        seller = %context.seller_id,
        examples = payload.examples.len(),
        "learning run invoked",
    );
    let examples = if payload.examples.is_empty() {
        learning::load_teacher_examples().map_err(|err| {
            AppError::Pipeline(PipelineError::internal("learning", err.to_string()))
        })?
    } else {
        payload.examples
    };
    let report = state
        .learning
        .run(&examples)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("learning", err.to_string())))?;
    state.pipeline.notify().emit(NotifyEvent::LearningSnapshot {
        report: report.clone(),
    });
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_draft_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<DraftRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/drafts");
    let id = state
        .queue
        .enqueue_draft(payload, context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound("job")),
    }
}

fn parse_draft_id(raw: &str) -> Result<uuid::Uuid, AppError> {
    uuid::Uuid::parse_str(raw).map_err(|_| {
        AppError::Pipeline(PipelineError::invalid_input("drafts", "invalid_draft_id"))
    })
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(&'static str),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound(what) => {
                let payload = ApiError {
                    error: "not_found".to_string(),
                    detail: Some(format!("{what} not found")),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryCandidate;
    use crate::models::DraftPhoto;
    use crate::pipeline::testutil::empty_draft;
    use crate::store::MemoryDraftStore;
    use tempfile::TempDir;

    fn priced_draft() -> Draft {
        let mut draft = empty_draft();
        draft.price = Some(PriceEstimate {
            low_pence: 2_000,
            mid_pence: 2_350,
            high_pence: 2_700,
        });
        draft.category = Some(CategoryCandidate {
            category_id: "1904".to_string(),
            display_path: "Men > Tops > Hoodies & Sweatshirts".to_string(),
            score: 0.9,
        });
        draft.photos.push(DraftPhoto {
            filename: "hoodie.jpg".to_string(),
            width: 260,
            height: 260,
            media_key: "media/hoodie".to_string(),
            position: 0,
        });
        draft
    }

    fn edit(selected_price: Option<i64>, status: Option<DraftStatus>) -> DraftUpdate {
        DraftUpdate {
            title: None,
            description: None,
            status,
            selected_price,
        }
    }

    #[tokio::test]
    async fn price_edit_appends_a_user_edit_correction() {
        let dir = TempDir::new().unwrap();
        let log = CorrectionLog::new(dir.path().join("corrections.jsonl"));
        let store = MemoryDraftStore::default();
        let draft = priced_draft();
        let id = draft.id;
        store.put(draft).await.unwrap();

        let updated = apply_draft_update(&store, &log, id, edit(Some(3_000), None))
            .await
            .unwrap();
        assert_eq!(updated.selected_price, Some(3_000));

        let records = log.read_recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, CorrectionSource::UserEdit);
        assert_eq!(records[0].predicted_pence, 2_350);
        assert_eq!(records[0].truth_pence, 3_000);
        assert_eq!(records[0].category_id, "1904");
    }

    #[tokio::test]
    async fn unchanged_selected_price_logs_nothing() {
        let dir = TempDir::new().unwrap();
        let log = CorrectionLog::new(dir.path().join("corrections.jsonl"));
        let store = MemoryDraftStore::default();
        let mut draft = priced_draft();
        draft.selected_price = Some(3_000);
        let id = draft.id;
        store.put(draft).await.unwrap();

        let updated = apply_draft_update(&store, &log, id, edit(Some(3_000), None))
            .await
            .unwrap();
        assert_eq!(updated.selected_price, Some(3_000));
        assert!(log.read_recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_photo_draft_cannot_leave_rejected() {
        let dir = TempDir::new().unwrap();
        let log = CorrectionLog::new(dir.path().join("corrections.jsonl"));
        let store = MemoryDraftStore::default();
        let mut draft = empty_draft();
        draft.status = DraftStatus::Rejected;
        let id = draft.id;
        store.put(draft).await.unwrap();

        let err = apply_draft_update(&store, &log, id, edit(None, Some(DraftStatus::Ready)))
            .await
            .unwrap_err();
        match err {
            AppError::Pipeline(err) => {
                assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
                assert_eq!(err.detail(), "rejected_draft_has_no_photos");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get(id).await.unwrap().status, DraftStatus::Rejected);
    }
}
