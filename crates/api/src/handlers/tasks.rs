use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use coordinator_core::models::{
    is_valid_digest, Decision, ResourceUsage, ResultPayload, Task, TaskFailure, TaskState,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::{empty, success},
    routes::AppState,
};

/// 领取请求
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub scheduler_id: String,
    pub node_id: String,
}

/// 展示用进度上报
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub task_id: i64,
    pub info: serde_json::Value,
}

/// 解答上报
///
/// `blob_digest` 引用已上传的内容，`inline_bytes` 以标准 base64 直接携带内容，
/// 二者必须且只能提供一个。较大的解答先通过 `POST /blob` 上传再引用摘要。
#[derive(Debug, Deserialize)]
pub struct SolutionRequest {
    pub task_id: i64,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub blob_digest: Option<String>,
    #[serde(default)]
    pub inline_bytes: Option<String>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

#[derive(Debug, Serialize)]
pub struct SolutionResponse {
    pub task_id: i64,
    pub digest: String,
    pub state: TaskState,
}

/// 失败上报
#[derive(Debug, Deserialize)]
pub struct ErrorRequest {
    pub task_id: i64,
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

/// 取消请求，`task_id` 与 `decision_id` 二选一
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub decision_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelAckRequest {
    pub task_id: i64,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusQuery {
    pub task_id: i64,
}

/// 任务状态视图
#[derive(Debug, Serialize)]
pub struct TaskStatusView {
    pub task_id: i64,
    pub decision_id: i64,
    pub state: TaskState,
    pub cancel_requested: bool,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub node_id: Option<String>,
    pub output_digest: Option<String>,
    pub progress: Option<serde_json::Value>,
}

impl From<Task> for TaskStatusView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            decision_id: task.decision_id,
            state: task.state,
            cancel_requested: task.cancel_requested,
            retry_count: task.retry_count,
            last_error: task.last_error,
            node_id: task.node_id,
            output_digest: task.output_digest,
            progress: task.progress,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CancelOutcome {
    Task(TaskStatusView),
    Decision(Decision),
}

/// 为节点领取一个任务；没有可放入的任务时 `data` 为 null
pub async fn claim_task(
    State(state): State<AppState>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state
        .services
        .lifecycle
        .claim_next(&request.scheduler_id, &request.node_id)
        .await?;
    Ok(success(task))
}

pub async fn report_progress(
    State(state): State<AppState>,
    payload: Result<Json<ProgressRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    state
        .services
        .lifecycle
        .report_progress(request.task_id, &request.info)
        .await?;
    Ok(empty("进度已记录"))
}

pub async fn report_solution(
    State(state): State<AppState>,
    payload: Result<Json<SolutionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let blobs = &state.services.blobs;

    let digest = match (request.blob_digest, request.inline_bytes) {
        (Some(digest), None) => {
            if !is_valid_digest(&digest) {
                return Err(ApiError::BadRequest(format!("无效的摘要: {}", digest)));
            }
            blobs.retain(&digest).await?;
            digest
        }
        (None, Some(encoded)) => {
            let bytes = general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| ApiError::BadRequest(format!("inline_bytes 不是有效的 base64: {e}")))?;
            blobs.put(&bytes).await?
        }
        _ => {
            return Err(ApiError::BadRequest(
                "blob_digest 与 inline_bytes 必须且只能提供一个".to_string(),
            ))
        }
    };

    // 上面取得的引用由 report_success 接管
    let task = state
        .services
        .lifecycle
        .report_success(
            request.task_id,
            request.node_id.as_deref(),
            ResultPayload {
                output_digest: digest.clone(),
                resource_usage: request.resource_usage,
            },
        )
        .await?;
    Ok(success(SolutionResponse {
        task_id: task.id,
        digest,
        state: task.state,
    }))
}

pub async fn report_error(
    State(state): State<AppState>,
    payload: Result<Json<ErrorRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state
        .services
        .lifecycle
        .report_failure(
            request.task_id,
            request.node_id.as_deref(),
            TaskFailure {
                message: request.message,
                transient: request.transient,
            },
        )
        .await?;
    Ok(success(TaskStatusView::from(task)))
}

pub async fn cancel(
    State(state): State<AppState>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let outcome = match (request.task_id, request.decision_id) {
        (Some(task_id), None) => {
            let task = state.services.lifecycle.cancel_task(task_id).await?;
            CancelOutcome::Task(task.into())
        }
        (None, Some(decision_id)) => {
            info!(decision_id, "收到决策取消请求");
            let decision = state.services.decisions.cancel_decision(decision_id).await?;
            CancelOutcome::Decision(decision)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "task_id 与 decision_id 必须且只能提供一个".to_string(),
            ))
        }
    };
    Ok(success(outcome))
}

pub async fn acknowledge_cancel(
    State(state): State<AppState>,
    payload: Result<Json<CancelAckRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state
        .services
        .lifecycle
        .acknowledge_cancel(request.task_id, request.node_id.as_deref())
        .await?;
    Ok(success(TaskStatusView::from(task)))
}

pub async fn task_status(
    State(state): State<AppState>,
    query: Result<Query<TaskStatusQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let task = state.services.lifecycle.task_status(query.task_id).await?;
    Ok(success(TaskStatusView::from(task)))
}
