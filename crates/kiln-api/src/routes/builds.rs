//! Build endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::mask::FieldMask;
use kiln_core::request::{
    BatchItem, BatchItemResponse, BatchRequest, CancelBuildRequest, GetBuildRequest,
    ScheduleBuildRequest,
};
use kiln_core::{Build, BuildId};
use kiln_scheduler::StatusUpdate;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the caller's identity.
pub const IDENTITY_HEADER: &str = "x-kiln-identity";
pub const ANONYMOUS: &str = "anonymous:anonymous";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(schedule_build))
        .route("/batch", post(batch))
        .route("/{id}", get(get_build))
        .route("/{id}/cancel", post(cancel_build))
        .route("/{id}/status", post(update_status))
}

fn identity(headers: &HeaderMap) -> String {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

fn render(build: &Build, mask: Option<&FieldMask>) -> Value {
    FieldMask::or_default(mask).trim(build)
}

async fn schedule_build(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ScheduleBuildRequest>,
) -> Result<Json<Value>, ApiError> {
    let mask = req.fields.clone();
    let build = state
        .scheduler
        .schedule_build(req, &identity(&headers))
        .await?;
    info!(build_id = %build.id, builder = %build.builder, "Scheduled build");
    Ok(Json(render(&build, mask.as_ref())))
}

async fn batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    let masks: Vec<Option<FieldMask>> = req
        .requests
        .iter()
        .map(|item| match item {
            BatchItem::ScheduleBuild(r) => r.fields.clone(),
            BatchItem::GetBuild(r) => r.fields.clone(),
            BatchItem::SearchBuilds(r) => r.fields.clone(),
            BatchItem::CancelBuild(r) => r.fields.clone(),
        })
        .collect();

    let response = state.scheduler.batch(req, &identity(&headers)).await;

    let responses: Vec<Value> = response
        .responses
        .iter()
        .zip(&masks)
        .map(|(r, mask)| match r {
            BatchItemResponse::ScheduleBuild(b) => {
                json!({ "schedule_build": render(b, mask.as_ref()) })
            }
            BatchItemResponse::GetBuild(b) => json!({ "get_build": render(b, mask.as_ref()) }),
            BatchItemResponse::SearchBuilds(builds) => {
                let builds: Vec<Value> = builds.iter().map(|b| render(b, mask.as_ref())).collect();
                json!({ "search_builds": builds })
            }
            BatchItemResponse::CancelBuild(b) => {
                json!({ "cancel_build": render(b, mask.as_ref()) })
            }
            BatchItemResponse::Error(e) => json!({ "error": e }),
        })
        .collect();
    Ok(Json(json!({ "responses": responses })))
}

#[derive(Debug, Default, Deserialize)]
struct FieldsQuery {
    /// Comma-separated paths.
    fields: Option<String>,
}

impl FieldsQuery {
    fn mask(&self) -> Option<FieldMask> {
        self.fields
            .as_deref()
            .map(|f| FieldMask::new(f.split(',').map(str::trim).filter(|p| !p.is_empty())))
    }
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<FieldsQuery>,
) -> Result<Json<Value>, ApiError> {
    let req = GetBuildRequest {
        id: Some(BuildId::new(id)),
        fields: query.mask(),
        ..Default::default()
    };
    let build = state.scheduler.get(&req).await?;
    Ok(Json(render(&build, req.fields.as_ref())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CancelBody {
    summary_markdown: String,
    fields: Option<FieldMask>,
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Value>, ApiError> {
    let req = CancelBuildRequest {
        id: BuildId::new(id),
        summary_markdown: body.summary_markdown,
        fields: body.fields,
    };
    let build = state.scheduler.cancel(&req).await?;
    info!(build_id = %build.id, status = %build.status, "Canceled build");
    Ok(Json(render(&build, req.fields.as_ref())))
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    let now = state.scheduler.clock().now();
    let outcome = state
        .scheduler
        .status()
        .update_status(BuildId::new(id), &update, now)
        .await?;
    Ok(Json(json!({
        "changed": outcome.changed,
        "build": render(&outcome.build, None),
    })))
}
