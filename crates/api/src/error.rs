use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coordinator_core::CoordinatorError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("协调器错误: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("请求体格式错误: {0}")]
    Json(#[from] JsonRejection),

    #[error("查询参数错误: {0}")]
    Query(#[from] QueryRejection),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str, Vec<String>) {
        match self {
            ApiError::Coordinator(err) if err.is_not_found() => (
                StatusCode::NOT_FOUND,
                err.to_string(),
                not_found_type(err),
                vec![
                    "请检查标识是否正确".to_string(),
                    "已删除的决策及其任务不可再查询".to_string(),
                ],
            ),
            ApiError::Coordinator(err) if err.is_conflict() => (
                StatusCode::CONFLICT,
                err.to_string(),
                conflict_type(err),
                vec![
                    "请求的操作与当前状态冲突".to_string(),
                    "使用 GET /task/status 查询最新状态后再决定是否重试".to_string(),
                ],
            ),
            ApiError::Coordinator(CoordinatorError::InvariantViolation(msg)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("不变量被破坏: {}", msg),
                "INVARIANT_VIOLATION",
                vec!["请求会破坏协调器的一致性，已被拒绝".to_string()],
            ),
            ApiError::Coordinator(CoordinatorError::Timeout(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("操作超时: {}", msg),
                "TIMEOUT",
                vec!["协调器繁忙，请稍后重试".to_string()],
            ),
            ApiError::Coordinator(CoordinatorError::InvalidArgument(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {}", msg),
                "INVALID_ARGUMENT",
                vec!["请检查请求参数".to_string()],
            ),
            ApiError::Coordinator(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
                vec![
                    "系统遇到内部错误，请稍后重试".to_string(),
                    format!("错误详情: {}", err),
                ],
            ),
            ApiError::Json(rejection) => (
                StatusCode::BAD_REQUEST,
                "请求数据格式错误".to_string(),
                "SERIALIZATION_ERROR",
                vec![
                    "请检查JSON格式是否正确".to_string(),
                    "确保Content-Type为application/json".to_string(),
                    format!("详细错误: {}", rejection.body_text()),
                ],
            ),
            ApiError::Query(rejection) => (
                StatusCode::BAD_REQUEST,
                "查询参数错误".to_string(),
                "INVALID_QUERY",
                vec![format!("详细错误: {}", rejection.body_text())],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {}", msg),
                "BAD_REQUEST",
                vec!["请检查请求格式和参数".to_string()],
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
                vec![format!("错误详情: {}", msg)],
            ),
        }
    }
}

fn not_found_type(err: &CoordinatorError) -> &'static str {
    match err {
        CoordinatorError::JobNotFound { .. } => "JOB_NOT_FOUND",
        CoordinatorError::DecisionNotFound { .. } => "DECISION_NOT_FOUND",
        CoordinatorError::TaskNotFound { .. } => "TASK_NOT_FOUND",
        CoordinatorError::SchedulerNotFound { .. } => "SCHEDULER_NOT_FOUND",
        CoordinatorError::NodeNotFound { .. } => "NODE_NOT_FOUND",
        CoordinatorError::BlobNotFound { .. } => "BLOB_NOT_FOUND",
        _ => "NOT_FOUND",
    }
}

fn conflict_type(err: &CoordinatorError) -> &'static str {
    match err {
        CoordinatorError::InvalidTransition { .. } => "INVALID_TRANSITION",
        CoordinatorError::NotInProcessing { .. } => "NOT_IN_PROCESSING",
        CoordinatorError::DecisionNotActive { .. } => "DECISION_NOT_ACTIVE",
        CoordinatorError::JobAlreadyRunning { .. } => "JOB_ALREADY_RUNNING",
        CoordinatorError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
        _ => "CONFLICT",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type, suggestions) = self.parts();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "请求处理失败");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: CoordinatorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_not_found_maps_to_404() {
        assert_eq!(
            status_of(CoordinatorError::TaskNotFound { id: 1 }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CoordinatorError::BlobNotFound {
                digest: "ab".to_string()
            }),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_conflicts_map_to_409() {
        assert_eq!(
            status_of(CoordinatorError::InvalidTransition {
                task_id: 1,
                from: "FINISHED".to_string(),
                to: "ERROR".to_string(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoordinatorError::DecisionNotActive { id: 3 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoordinatorError::CapacityExceeded {
                node_id: "n".to_string()
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_other_classes() {
        assert_eq!(
            status_of(CoordinatorError::InvariantViolation("over-release".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(CoordinatorError::Timeout("lock".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(CoordinatorError::InvalidArgument("empty".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(CoordinatorError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::BadRequest("x".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(
            not_found_type(&CoordinatorError::DecisionNotFound { id: 1 }),
            "DECISION_NOT_FOUND"
        );
        assert_eq!(
            conflict_type(&CoordinatorError::JobAlreadyRunning {
                job_id: 1,
                decision_id: 2
            }),
            "JOB_ALREADY_RUNNING"
        );
    }
}
