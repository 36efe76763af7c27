//! HTTP trigger surface.
//!
//! Exposes the sync trigger (`POST /sync`), project provisioning, the run
//! audit trail, and a liveness endpoint. Kept deliberately small: the
//! server is a thin shell over `reconcile::sync_batch` and the store.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::db::{DbError, DbProject, DbSyncRun};
use crate::reconcile::sync_batch;
use crate::state::AppState;
use crate::types::{SyncRequest, SyncResponse};

/// Runs returned by the audit listing.
const RUN_HISTORY_LIMIT: u32 = 20;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/sync", post(run_sync))
        .route("/projects", get(list_projects).post(upsert_project))
        .route("/projects/{id}/runs", get(list_runs))
        .with_state(state)
        .layer(cors)
}

/// Standard API error response.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Convert store errors to HTTP responses.
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse { error: self.1 });
        (self.0, body).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

/// GET /health — liveness for the deployment platform.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

/// POST /sync — trigger a reconciliation run.
///
/// Always answers 200 with the aggregate result; per-project problems live
/// in the report's failure lists, and `success: false` marks the few
/// top-level failures (unknown project, unreachable store is the exception
/// that 500s).
async fn run_sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let db = state.open_db()?;
    let response = sync_batch(&db, &state.config, &request).await;
    Ok(Json(response))
}

/// GET /projects — list configured projects (tokens are never serialized).
async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DbProject>>, AppError> {
    let db = state.open_db()?;
    Ok(Json(db.list_projects()?))
}

/// Request body for provisioning a project.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertProjectRequest {
    id: String,
    name: String,
    organization_uri: String,
    access_token: Option<String>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_sync_enabled")]
    sync_enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_sync_enabled() -> bool {
    true
}

/// POST /projects — create or update a project integration.
async fn upsert_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertProjectRequest>,
) -> Result<(StatusCode, Json<DbProject>), AppError> {
    let db = state.open_db()?;
    let now = Utc::now().to_rfc3339();
    let project = DbProject {
        id: request.id,
        name: request.name,
        organization_uri: request.organization_uri,
        access_token: request.access_token,
        timezone: request.timezone,
        sync_enabled: request.sync_enabled,
        last_synced_at: None,
        created_at: now.clone(),
        updated_at: now,
    };
    db.upsert_project(&project)?;

    let stored = db
        .get_project(&project.id)?
        .ok_or_else(|| AppError(StatusCode::INTERNAL_SERVER_ERROR, "upsert vanished".into()))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /projects/{id}/runs — recent sync runs for a project.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<DbSyncRun>>, AppError> {
    let db = state.open_db()?;
    if db.get_project(&project_id)?.is_none() {
        return Err(AppError(
            StatusCode::NOT_FOUND,
            format!("Project not found: {}", project_id),
        ));
    }
    Ok(Json(db.list_recent_runs(&project_id, RUN_HISTORY_LIMIT)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = AppConfig::default();
        config.database_path = Some(dir.path().join("server-test.db"));
        std::mem::forget(dir);
        Arc::new(AppState::new(config))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_project_provisioning_roundtrip() {
        let state = test_state();
        let app = router(state.clone());

        let body = serde_json::json!({
            "id": "p1",
            "name": "Acme Funnel",
            "organizationUri": "https://api.booking-platform.com/v2/organizations/org-1",
            "accessToken": "tok-secret",
            "timezone": "America/Chicago"
        });
        let response = router(state.clone())
            .oneshot(
                Request::post("/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["id"], "p1");
        // Tokens never serialize.
        assert!(created.get("accessToken").is_none());

        let response = app
            .oneshot(Request::get("/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["timezone"], "America/Chicago");
    }

    #[tokio::test]
    async fn test_sync_unknown_project_reports_failure() {
        let app = router(test_state());
        let body = serde_json::json!({ "projectId": "ghost" });
        let response = app
            .oneshot(
                Request::post("/sync")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_sync_empty_batch_succeeds() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::post("/sync")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["projects"], 0);
    }

    #[tokio::test]
    async fn test_runs_for_unknown_project_404s() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::get("/projects/ghost/runs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
