// HTTP route handlers for the Soliditybytes API

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use soliditybytes_common::types::{
    ExerciseDetail, ExerciseFile, ExerciseSummary, Mode, Requester, SolutionFiles, Visibility,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{current_user, UserProfile};
use crate::error::ApiError;
use crate::metrics;
use crate::registry::SubmissionSnapshot;
use crate::submissions::NewSubmission;
use crate::AppState;

/// GET /health - Liveness check
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn metrics_endpoint() -> Result<Response, ApiError> {
    let body = metrics::render().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// GET /exercises - Summaries of every listed exercise
pub async fn list_exercises(State(state): State<Arc<AppState>>) -> Json<Vec<ExerciseSummary>> {
    Json(state.catalog.list(None))
}

/// GET /exercises/:id - Exercise detail without solution or test bodies
pub async fn get_exercise(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExerciseDetail>, ApiError> {
    let exercise = state.catalog.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(exercise.detail()))
}

/// GET /exercises/:id/solution - Solution files, gated by visibility
pub async fn get_solution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SolutionFiles>, ApiError> {
    let exercise = state.catalog.get(&id).ok_or(ApiError::NotFound)?;
    let user = current_user(&state, &headers);

    match exercise.visibility {
        Visibility::Public => {}
        Visibility::Hidden => return Err(ApiError::Forbidden),
        Visibility::Authenticated => {
            user.ok_or(ApiError::Unauthorized)?;
        }
        Visibility::AfterPass => {
            let user = user.ok_or(ApiError::Unauthorized)?;
            let solved = state
                .progress
                .read(&Requester::User(user.id.clone()))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            if !solved.contains(&exercise.id) {
                debug!(user_id = %user.id, exercise_id = %exercise.id, "Solution locked until solved");
                return Err(ApiError::Forbidden);
            }
        }
    }

    Ok(Json(SolutionFiles {
        id: exercise.id.clone(),
        files: exercise.solution.files.clone(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub overrides: Option<Vec<ExerciseFile>>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub submission_id: String,
}

/// Who a request acts for: a signed-in user wins over a device id
fn requester(user: Option<&UserProfile>, device_id: Option<&str>) -> Option<Requester> {
    if let Some(user) = user {
        return Some(Requester::User(user.id.clone()));
    }
    device_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| Requester::Device(id.to_string()))
}

/// POST /submissions - Start a run of an exercise
pub async fn create_submission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let id = payload
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingId)?;
    let exercise = state.catalog.get(id).ok_or(ApiError::ExerciseNotFound)?;

    let overrides = payload.overrides.unwrap_or_default();
    let override_bytes: usize = overrides
        .iter()
        .map(|f| f.path.len() + f.content.len())
        .sum();
    if override_bytes > state.config.max_override_bytes {
        return Err(ApiError::OverridesTooLarge {
            limit: state.config.max_override_bytes,
        });
    }

    let user = current_user(&state, &headers);
    let submission_id = state.submissions.create(NewSubmission {
        exercise,
        mode: payload.mode.unwrap_or_default(),
        overrides,
        requester: requester(user.as_ref(), payload.device_id.as_deref()),
    })?;

    Ok(Json(SubmitResponse { submission_id }))
}

/// GET /submissions/:id - Status snapshot of a submission
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Json<SubmissionSnapshot>, ApiError> {
    let entry = state
        .registry
        .get(&submission_id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(entry.snapshot()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub solved: BTreeMap<String, bool>,
}

async fn read_progress(
    state: &AppState,
    requester: Option<Requester>,
) -> Result<ProgressResponse, ApiError> {
    let solved = match requester {
        Some(requester) => state
            .progress
            .read(&requester)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        None => Default::default(),
    };
    Ok(ProgressResponse {
        solved: solved.into_iter().map(|id| (id, true)).collect(),
    })
}

/// GET /progress?deviceId= - Anonymous progress
pub async fn device_progress(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let requester = requester(None, query.device_id.as_deref());
    Ok(Json(read_progress(&state, requester).await?))
}

/// GET /me/progress - Progress of the signed-in user
pub async fn my_progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProgressResponse>, ApiError> {
    let user = current_user(&state, &headers).ok_or(ApiError::Unauthorized)?;
    info!(user_id = %user.id, "Progress requested");
    Ok(Json(
        read_progress(&state, Some(Requester::User(user.id))).await?,
    ))
}
