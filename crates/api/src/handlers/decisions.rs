use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use coordinator_core::models::TaskSpec;
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiResult,
    response::{created, empty, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StartDecisionRequest {
    pub job_id: i64,
    #[serde(default)]
    pub configuration_digest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTasksRequest {
    pub decision_id: i64,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Serialize)]
pub struct CreateTasksResponse {
    pub task_ids: Vec<i64>,
}

/// 只携带决策标识的请求
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision_id: i64,
}

pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let job = state
        .services
        .decisions
        .create_job(&request.name, request.parent_id)
        .await?;
    Ok(created(job))
}

pub async fn start_decision(
    State(state): State<AppState>,
    payload: Result<Json<StartDecisionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let decision = state
        .services
        .decisions
        .start_decision(request.job_id, request.configuration_digest.as_deref())
        .await?;
    Ok(created(decision))
}

pub async fn create_tasks(
    State(state): State<AppState>,
    payload: Result<Json<CreateTasksRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let tasks = state
        .services
        .decisions
        .create_tasks(request.decision_id, request.tasks)
        .await?;
    Ok(created(CreateTasksResponse {
        task_ids: tasks.into_iter().map(|task| task.id).collect(),
    }))
}

pub async fn seal_decision(
    State(state): State<AppState>,
    payload: Result<Json<DecisionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let decision = state
        .services
        .decisions
        .seal_decision(request.decision_id)
        .await?;
    Ok(success(decision))
}

pub async fn delete_decision(
    State(state): State<AppState>,
    payload: Result<Json<DecisionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    state
        .services
        .decisions
        .delete_decision(request.decision_id)
        .await?;
    Ok(empty("决策已删除"))
}

/// 计数器、完成比例和预计剩余时间
pub async fn decision_progress(
    State(state): State<AppState>,
    query: Result<Query<DecisionRequest>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let summary = state.services.progress.summary(query.decision_id).await?;
    Ok(success(summary))
}
