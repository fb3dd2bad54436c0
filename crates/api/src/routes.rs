use axum::{
    routing::{get, post},
    Router,
};
use coordinator_dispatcher::CoordinatorServices;

use crate::handlers::{
    blobs::{download_blob, release_blob, upload_blob},
    decisions::{
        create_job, create_tasks, decision_progress, delete_decision, seal_decision,
        start_decision,
    },
    health::health_check,
    scheduler::{heartbeat, list_schedulers, register_scheduler},
    tasks::{
        acknowledge_cancel, cancel, claim_task, report_error, report_progress, report_solution,
        task_status,
    },
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub services: CoordinatorServices,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 调度器接口
        .route("/scheduler/register", post(register_scheduler))
        .route("/scheduler/heartbeat", post(heartbeat))
        .route("/scheduler/list", get(list_schedulers))
        // 任务接口
        .route("/task/claim", post(claim_task))
        .route("/task/progress", post(report_progress))
        .route("/task/solution", post(report_solution))
        .route("/task/error", post(report_error))
        .route("/task/cancel", post(cancel))
        .route("/task/cancel/ack", post(acknowledge_cancel))
        .route("/task/status", get(task_status))
        // 生产者接口
        .route("/job", post(create_job))
        .route("/decision/start", post(start_decision))
        .route("/decision/tasks", post(create_tasks))
        .route("/decision/seal", post(seal_decision))
        .route("/decision/delete", post(delete_decision))
        .route("/decision/progress", get(decision_progress))
        // Blob 接口
        .route("/blob", post(upload_blob))
        .route("/blob/release", post(release_blob))
        .route("/blob/{digest}", get(download_blob))
        .with_state(state)
}
