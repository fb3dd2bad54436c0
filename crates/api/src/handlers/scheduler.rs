use axum::{extract::rejection::JsonRejection, extract::State, response::IntoResponse, Json};
use coordinator_core::models::{NodeInfo, NodeSnapshot};
use serde::{Deserialize, Serialize};

use crate::{error::ApiResult, response::success, routes::AppState};

/// 调度器注册请求
#[derive(Debug, Deserialize)]
pub struct RegisterSchedulerRequest {
    /// 调度器类型，同时决定它从哪个队列领取任务
    #[serde(rename = "type")]
    pub scheduler_type: String,
    /// 重新注册时携带原来的标识
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterSchedulerResponse {
    pub scheduler_id: String,
}

/// 调度器心跳请求
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub scheduler_id: String,
    #[serde(default)]
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub scheduler_id: String,
    pub nodes: Vec<NodeInfo>,
}

pub async fn register_scheduler(
    State(state): State<AppState>,
    payload: Result<Json<RegisterSchedulerRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let scheduler = state
        .services
        .registry
        .register(request.id.as_deref(), &request.scheduler_type)
        .await?;
    Ok(success(RegisterSchedulerResponse {
        scheduler_id: scheduler.id,
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let nodes = state
        .services
        .registry
        .heartbeat(&request.scheduler_id, &request.nodes)
        .await?;
    Ok(success(HeartbeatResponse {
        scheduler_id: request.scheduler_id,
        nodes,
    }))
}

/// 列出调度器及其存活状态和节点
pub async fn list_schedulers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let schedulers = state.services.registry.list().await?;
    Ok(success(schedulers))
}
