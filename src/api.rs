// 🌐 REST API - thin axum layer over the services
//
// Every handler locks the shared connection, calls one service and wraps the
// result in ApiResponse. AdminError maps to an HTTP status in one place.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::batches::{BatchService, BatchSummary, NewBatch};
use crate::config::AppConfig;
use crate::enrollment::get_profile;
use crate::entities::{Batch, EnrollmentStatus, Program, ProgramProfile};
use crate::error::{AdminError, Result};
use crate::reconciliation::{ReconciliationEngine, ReconciliationReport};
use crate::siblings::{SiblingInfo, SiblingService};
use crate::students::{
    ExportFormat, NewStudent, StudentDetail, StudentFilter, StudentService, StudentSummary,
};
use crate::webhook::{WebhookOutcome, WebhookProcessor};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(conn: Connection, config: AppConfig) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AdminError::Internal("database lock poisoned".to_string()))
    }
}

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, AdminError>;

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
            AdminError::InvalidSignature(_)
            | AdminError::UnknownStatus(_)
            | AdminError::Json(_) => StatusCode::BAD_REQUEST,
            AdminError::Database(_)
            | AdminError::Csv(_)
            | AdminError::Config(_)
            | AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(ApiResponse::failure(self.to_string()))).into_response()
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/batches
async fn list_batches(State(state): State<AppState>) -> ApiResult<Vec<BatchSummary>> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(BatchService::new(&conn).list_batches()?)))
}

/// POST /api/batches
async fn create_batch(
    State(state): State<AppState>,
    Json(input): Json<NewBatch>,
) -> std::result::Result<(StatusCode, Json<ApiResponse<Batch>>), AdminError> {
    let conn = state.conn()?;
    let batch =
        BatchService::new(&conn).create_batch(&input.name, input.start_date, input.end_date)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(batch))))
}

/// Query string for GET /api/students; enum values parse case-insensitively
#[derive(Debug, Default, Deserialize)]
pub struct StudentQuery {
    pub program: Option<String>,
    pub status: Option<String>,
    pub batch_id: Option<String>,
    pub search: Option<String>,
}

impl StudentQuery {
    pub fn to_filter(&self) -> Result<StudentFilter> {
        Ok(StudentFilter {
            program: self.program.as_deref().map(str::parse::<Program>).transpose()?,
            status: self
                .status
                .as_deref()
                .map(str::parse::<EnrollmentStatus>)
                .transpose()?,
            batch_id: self.batch_id.clone(),
            search: self.search.clone(),
        })
    }
}

/// GET /api/students?program=&status=&batch_id=&search=
async fn list_students(
    State(state): State<AppState>,
    Query(query): Query<StudentQuery>,
) -> ApiResult<Vec<StudentSummary>> {
    let filter = query.to_filter()?;
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(StudentService::new(&conn).list_students(&filter)?)))
}

/// POST /api/students
async fn create_student(
    State(state): State<AppState>,
    Json(input): Json<NewStudent>,
) -> std::result::Result<(StatusCode, Json<ApiResponse<ProgramProfile>>), AdminError> {
    let conn = state.conn()?;
    let profile = StudentService::new(&conn).create_student(&input, Utc::now().date_naive())?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(profile))))
}

/// GET /api/students/:id
async fn get_student(
    State(state): State<AppState>,
    Path(profile_id): Path<String>,
) -> ApiResult<StudentDetail> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(StudentService::new(&conn).get_student(&profile_id)?)))
}

/// GET /api/students/:id/siblings
async fn get_siblings(
    State(state): State<AppState>,
    Path(profile_id): Path<String>,
) -> ApiResult<Vec<SiblingInfo>> {
    let conn = state.conn()?;
    let profile = get_profile(&conn, &profile_id)?;
    Ok(Json(ApiResponse::ok(SiblingService::new(&conn).siblings_of(&profile.person_id)?)))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

/// GET /api/export?format=json|csv - raw file, not wrapped
async fn export_students(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> std::result::Result<Response, AdminError> {
    let format = query
        .format
        .as_deref()
        .map(str::parse::<ExportFormat>)
        .transpose()?
        .unwrap_or(ExportFormat::Json);

    let conn = state.conn()?;
    let body = StudentService::new(&conn).export_students(format)?;
    let (content_type, filename) = match format {
        ExportFormat::Json => ("application/json", "students.json"),
        ExportFormat::Csv => ("text/csv; charset=utf-8", "students.csv"),
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        body,
    )
        .into_response())
}

/// GET /api/reconciliation
async fn reconciliation(State(state): State<AppState>) -> ApiResult<ReconciliationReport> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(ReconciliationEngine::new().run(&conn)?)))
}

/// POST /api/webhooks/:program - body must be the exact bytes that were signed
async fn receive_webhook(
    State(state): State<AppState>,
    Path(program): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WebhookOutcome> {
    let program: Program = program
        .parse()
        .map_err(|_| AdminError::not_found("Webhook endpoint", &program))?;
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let processor = WebhookProcessor::from_config(&state.config, program)?;
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(processor.handle(&conn, &body, signature)?)))
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/batches", get(list_batches).post(create_batch))
        .route("/students", get(list_students).post(create_student))
        .route("/students/:id", get(get_student))
        .route("/students/:id/siblings", get(get_siblings))
        .route("/export", get(export_students))
        .route("/reconciliation", get(reconciliation))
        .route("/webhooks/:program", post(receive_webhook))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::webhook::sign_payload;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test";

    fn app() -> (Router, AppState) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let config = AppConfig {
            dugsi_webhook_secret: Some(SECRET.to_string()),
            ..Default::default()
        };
        let state = AppState::new(conn, config);
        (build_router(state.clone()), state)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(app, get_req("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_create_and_list_batches() {
        let (app, _) = app();
        let (status, _) = send(
            app.clone(),
            post_json("/api/batches", json!({"name": "Fall 2025", "start_date": "2025-09-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            app.clone(),
            post_json("/api/batches", json!({"name": "Fall 2025", "start_date": "2025-09-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(app, get_req("/api/batches")).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["name"], "Fall 2025");
        assert_eq!(body["data"][0]["student_count"], 0);
    }

    #[tokio::test]
    async fn test_student_endpoints() {
        let (app, _) = app();
        let (status, body) = send(
            app.clone(),
            post_json(
                "/api/students",
                json!({
                    "first_name": "Amina",
                    "last_name": "Farah",
                    "program": "MAHAD",
                    "monthly_rate": 15000
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        let profile_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(app.clone(), get_req("/api/students?program=mahad")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"][0]["first_name"], "Amina");

        let (_, body) = send(app.clone(), get_req("/api/students?program=dugsi")).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["data"].as_array().unwrap().is_empty());

        let detail_uri = format!("/api/students/{}", profile_id);
        let (status, _) = send(app.clone(), get_req(&detail_uri)).await;
        assert_eq!(status, StatusCode::OK);

        let siblings_uri = format!("/api/students/{}/siblings", profile_id);
        let (status, body) = send(app.clone(), get_req(&siblings_uri)).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, body) = send(app, get_req("/api/students/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_invalid_input_is_unprocessable() {
        let (app, _) = app();
        let (status, _) = send(app.clone(), get_req("/api/students?status=sleeping")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let blank = json!({"first_name": "", "last_name": ""});
        let (status, body) = send(app, post_json("/api/students", blank)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("first_name"));
    }

    #[tokio::test]
    async fn test_csv_export() {
        let (app, _) = app();
        send(
            app.clone(),
            post_json(
                "/api/students",
                json!({"first_name": "Idris", "last_name": "Ali", "program": "DUGSI"}),
            ),
        )
        .await;

        let response = app.oneshot(get_req("/api/export?format=csv")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Idris"));
    }

    #[tokio::test]
    async fn test_reconciliation_on_empty_database() {
        let (app, _) = app();
        let (status, body) = send(app, get_req("/api/reconciliation")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], true);
    }

    fn webhook_req(program: &str, payload: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/webhooks/{}", program));
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_signature_and_idempotency() {
        let (app, state) = app();
        let payload = json!({
            "id": "evt_api_1",
            "type": "customer.created",
            "created": 1_760_000_000,
            "data": {"object": {}}
        })
        .to_string();
        let now = Utc::now().timestamp();
        let signature = format!("t={},v1={}", now, sign_payload(SECRET, now, &payload).unwrap());

        let first = webhook_req("dugsi", &payload, Some(signature.clone()));
        let (status, body) = send(app.clone(), first).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"]["outcome"], "ignored");

        let (_, body) = send(app.clone(), webhook_req("dugsi", &payload, Some(signature))).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"]["outcome"], "duplicate");

        let bad = format!("t={},v1={}", now, sign_payload("wrong", now, &payload).unwrap());
        let (status, _) = send(app.clone(), webhook_req("dugsi", &payload, Some(bad))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app.clone(), webhook_req("dugsi", &payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No secret configured for this program
        let (status, _) = send(app.clone(), webhook_req("mahad", &payload, None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = send(app, webhook_req("summer", &payload, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let conn = state.db.lock().unwrap();
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM webhook_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, 1);
    }
}
