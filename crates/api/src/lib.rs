//! # coordinator-api
//!
//! 协调器的 HTTP 接口，基于 Axum。
//!
//! ## 端点
//!
//! ### 调度器
//! - `POST /scheduler/register` - 注册调度器
//! - `POST /scheduler/heartbeat` - 心跳并上报节点快照
//! - `GET /scheduler/list` - 调度器、存活状态与节点
//!
//! ### 任务
//! - `POST /task/claim` - 为节点领取任务
//! - `POST /task/progress` - 展示用进度
//! - `POST /task/solution` - 成功上报（摘要或内联内容）
//! - `POST /task/error` - 失败上报
//! - `POST /task/cancel` - 取消任务或整个决策
//! - `POST /task/cancel/ack` - worker 确认取消
//! - `GET /task/status?task_id=` - 任务状态
//!
//! ### 生产者
//! - `POST /job`, `POST /decision/start`, `POST /decision/tasks`,
//!   `POST /decision/seal`, `POST /decision/delete`
//! - `GET /decision/progress?decision_id=` - 计数器与预计剩余时间
//!
//! ### Blob
//! - `POST /blob` - 上传原始内容，返回摘要
//! - `GET /blob/{digest}` - 下载
//! - `POST /blob/release` - 释放上传时取得的引用
//!
//! ## 响应格式
//!
//! 成功：
//! ```json
//! { "success": true, "data": { "scheduler_id": "..." }, "message": null, "timestamp": "..." }
//! ```
//!
//! 失败：
//! ```json
//! {
//!   "success": false,
//!   "error": {
//!     "message": "任务未找到: 42",
//!     "type": "TASK_NOT_FOUND",
//!     "code": 404,
//!     "suggestions": ["..."],
//!     "timestamp": "..."
//!   }
//! }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::{extract::DefaultBodyLimit, Router};
use coordinator_core::config::ApiConfig;
use coordinator_dispatcher::CoordinatorServices;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, timeout_layer, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(services: CoordinatorServices, config: &ApiConfig) -> Router {
    let state = AppState { services };
    let body_limit = config.max_request_size_mb.saturating_mul(1024 * 1024);

    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(timeout_layer(config))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if config.cors_enabled {
        router.layer(cors_layer(config))
    } else {
        router
    }
}
