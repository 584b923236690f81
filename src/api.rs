//! REST API server for the financial query engine
//!
//! Exposes ingestion, natural-language questions and record listing over
//! HTTP. Every endpoint answers with the same `ApiResponse` envelope.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::QueryEngine;
use crate::error::PipelineError;
use crate::ingestion::{ingest_batch, IngestionBatch};
use crate::models::{DuplicatePolicy, RecordFilter, SourceSystem};

pub const FALLBACK_ANSWER: &str =
    "I could not understand the question well enough to query the financial data. Try rephrasing it.";

const MAX_LIST_LIMIT: u32 = 1_000;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub file_path: Option<String>,
    pub document: Option<Value>,
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FinancialsQuery {
    pub category: Option<String>,
    pub source: Option<String>,
    pub account: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TurnsQuery {
    pub limit: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::NormalizationError(_) | PipelineError::SynthesisError(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::InvalidRequest(_) | PipelineError::UnsafeQueryError(_) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
        PipelineError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: PipelineError) -> ApiResult {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(code = e.code(), "{}", e);
    } else {
        warn!(code = e.code(), "{}", e);
    }

    let mut body = ApiResponse::error(format!("{}: {}", e.code(), e));
    if matches!(e, PipelineError::SynthesisError(_)) {
        body.data = Some(serde_json::json!({ "answer": FALLBACK_ANSWER }));
    }

    (status, Json(body))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<QueryEngine>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let records = state.engine.store().count().await.ok();
    Json(serde_json::json!({
        "status": "healthy",
        "records": records,
        "sessions": state.engine.context().session_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Ingestion Endpoints
/// =============================

async fn ingest(state: ApiState, source: SourceSystem, req: IngestRequest) -> ApiResult {
    let batch = match (req.file_path, req.document) {
        (Some(path), None) => match IngestionBatch::from_path(source, &path).await {
            Ok(batch) => batch,
            Err(e) => return error_response(e),
        },
        (None, Some(document)) => IngestionBatch::inline(source, document),
        _ => {
            return error_response(PipelineError::InvalidRequest(
                "Provide exactly one of `file_path` or `document`".to_string(),
            ))
        }
    };

    info!(source = %source, label = %batch.label, "Received ingestion request");

    match ingest_batch(state.engine.store(), &batch, req.duplicates).await {
        Ok(report) => ok(report),
        Err(e) => error_response(e),
    }
}

async fn ingest_quickbooks(
    State(state): State<ApiState>,
    Json(req): Json<IngestRequest>,
) -> ApiResult {
    ingest(state, SourceSystem::QuickBooks, req).await
}

async fn ingest_rootfi(
    State(state): State<ApiState>,
    Json(req): Json<IngestRequest>,
) -> ApiResult {
    ingest(state, SourceSystem::Rootfi, req).await
}

/// =============================
/// Question Endpoint
/// =============================

async fn ask(State(state): State<ApiState>, Json(req): Json<AskRequest>) -> ApiResult {
    match state
        .engine
        .ask(req.session_id.as_deref(), &req.question)
        .await
    {
        Ok(answer) => ok(answer),
        Err(e) => error_response(e),
    }
}

/// =============================
/// Listing Endpoints
/// =============================

fn parse_query_date(field: &str, raw: Option<&str>) -> crate::Result<Option<NaiveDate>> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
                PipelineError::InvalidRequest(format!("{} must be YYYY-MM-DD, got {}", field, s))
            })
        })
        .transpose()
}

fn build_filter(query: FinancialsQuery) -> crate::Result<RecordFilter> {
    let source = query
        .source
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(SourceSystem::from_str)
        .transpose()?;

    Ok(RecordFilter {
        category: query.category.filter(|c| !c.trim().is_empty()),
        source,
        account: query.account.filter(|a| !a.trim().is_empty()),
        start: parse_query_date("start", query.start.as_deref())?,
        end: parse_query_date("end", query.end.as_deref())?,
        limit: query.limit.map(|l| l.min(MAX_LIST_LIMIT)),
    })
}

async fn list_financials(
    State(state): State<ApiState>,
    Query(query): Query<FinancialsQuery>,
) -> ApiResult {
    let filter = match build_filter(query) {
        Ok(filter) => filter,
        Err(e) => return error_response(e),
    };

    match state.engine.store().list_records(&filter).await {
        Ok(records) => ok(serde_json::json!({
            "count": records.len(),
            "records": records,
        })),
        Err(e) => error_response(e),
    }
}

async fn schema(State(state): State<ApiState>) -> ApiResult {
    match state.engine.store().column_manifest().await {
        Ok(columns) => ok(serde_json::json!({ "table": crate::store::TABLE_NAME, "columns": columns })),
        Err(e) => error_response(e),
    }
}

async fn session_turns(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Query(query): Query<TurnsQuery>,
) -> ApiResult {
    let context = state.engine.context();
    let limit = query.limit.unwrap_or(context.window());
    let turns = context.recent_turns(&session_id, limit).await;

    ok(serde_json::json!({
        "session_id": session_id,
        "turns": turns,
    }))
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<QueryEngine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/ingest/quickbooks", post(ingest_quickbooks))
        .route("/api/ingest/rootfi", post(ingest_rootfi))
        .route("/api/ask", post(ask))
        .route("/api/financials", get(list_financials))
        .route("/api/schema", get(schema))
        .route("/api/sessions/:session_id/turns", get(session_turns))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<QueryEngine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::memory::ConversationContext;
    use crate::store::RecordStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::json;
    use tower::ServiceExt;

    async fn router_with(replies: Vec<Result<String, String>>) -> Router {
        let store = Arc::new(RecordStore::in_memory().await.unwrap());
        let model = Arc::new(ScriptedModel::new(replies));
        let engine = QueryEngine::new(store, model, Arc::new(ConversationContext::new(5)), 50);
        create_router(Arc::new(engine))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, ApiResponse) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_uri(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn january_document() -> Value {
        json!({
            "data": [{
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "revenue": [{ "name": "Product Sales", "value": 1000 }],
                "operating_expenses": [{ "name": "Rent", "value": 250 }]
            }]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let router = router_with(vec![]).await;
        let response = router.oneshot(get_uri("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_and_list() {
        let router = router_with(vec![]).await;

        let (status, body) = send(
            &router,
            post_json("/api/ingest/rootfi", json!({ "document": january_document() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let data = body.data.unwrap();
        assert_eq!(data["inserted"], 2);
        assert_eq!(data["source_system"], "rootfi");

        let (status, body) = send(&router, get_uri("/api/financials?category=revenue&source=rootfi")).await;
        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["records"][0]["account_name"], "Product Sales");
        assert_eq!(data["records"][0]["period_start"], "2024-01-01");
    }

    #[tokio::test]
    async fn test_ingest_rejections() {
        let router = router_with(vec![]).await;

        let (status, body) = send(&router, post_json("/api/ingest/rootfi", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);

        let (status, _) = send(
            &router,
            post_json("/api/ingest/quickbooks", json!({ "document": { "unexpected": true } })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(
            &router,
            post_json("/api/ingest/quickbooks", json!({ "file_path": "/definitely/not/here.json" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ask_and_session_turns() {
        let router = router_with(vec![
            Ok("```sql\nSELECT SUM(amount) AS total FROM financial_records WHERE account_category = 'revenue'\n```".to_string()),
            Ok("Revenue was 1000.".to_string()),
        ])
        .await;
        send(&router, post_json("/api/ingest/rootfi", json!({ "document": january_document() }))).await;

        let (status, body) = send(
            &router,
            post_json("/api/ask", json!({ "session_id": "abc", "question": "Total revenue?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["answer"], "Revenue was 1000.");
        assert_eq!(data["session_id"], "abc");
        assert_eq!(data["row_count"], 1);

        let (status, body) = send(&router, get_uri("/api/sessions/abc/turns")).await;
        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["turns"].as_array().unwrap().len(), 1);
        assert_eq!(data["turns"][0]["question"], "Total revenue?");
    }

    #[tokio::test]
    async fn test_ask_error_mapping() {
        let router = router_with(vec![
            Ok("```sql\nSELECT 1; DROP TABLE financial_records\n```".to_string()),
            Err("service unavailable".to_string()),
        ])
        .await;

        let (status, body) = send(&router, post_json("/api/ask", json!({ "question": "Drop it" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.data.unwrap()["answer"], FALLBACK_ANSWER);

        let (status, body) = send(&router, post_json("/api/ask", json!({ "question": "Revenue?" }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.error.unwrap().starts_with("UPSTREAM_ERROR"));

        let (status, _) = send(&router, post_json("/api/ask", json!({ "question": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schema_and_bad_filters() {
        let router = router_with(vec![]).await;

        let (status, body) = send(&router, get_uri("/api/schema")).await;
        assert_eq!(status, StatusCode::OK);
        let columns = body.data.unwrap()["columns"].as_array().unwrap().clone();
        assert!(columns.iter().any(|c| c["name"] == "amount" && c["data_type"] == "REAL"));

        let (status, _) = send(&router, get_uri("/api/financials?source=xero")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, get_uri("/api/financials?start=January")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
