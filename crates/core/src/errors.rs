use thiserror::Error;

/// 协调器错误类型定义
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移错误: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("决策未找到: {id}")]
    DecisionNotFound { id: i64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("调度器未找到: {id}")]
    SchedulerNotFound { id: String },

    #[error("计算节点未找到: {id}")]
    NodeNotFound { id: String },

    #[error("Blob未找到: {digest}")]
    BlobNotFound { digest: String },

    #[error("无效的状态转换: 任务 {task_id} 从 {from} 到 {to}")]
    InvalidTransition {
        task_id: i64,
        from: String,
        to: String,
    },

    #[error("任务 {task_id} 不处于PROCESSING状态 (当前: {state})")]
    NotInProcessing { task_id: i64, state: String },

    #[error("决策 {id} 未处于运行状态")]
    DecisionNotActive { id: i64 },

    #[error("作业 {job_id} 已有活动决策 {decision_id}")]
    JobAlreadyRunning { job_id: i64, decision_id: i64 },

    #[error("节点 {node_id} 容量不足")]
    CapacityExceeded { node_id: String },

    #[error("不变量被破坏: {0}")]
    InvariantViolation(String),

    #[error("超时: {0}")]
    Timeout(String),

    #[error("任务队列错误: {0}")]
    TaskQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的请求参数: {0}")]
    InvalidArgument(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// 是否为"未找到"类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoordinatorError::JobNotFound { .. }
                | CoordinatorError::DecisionNotFound { .. }
                | CoordinatorError::TaskNotFound { .. }
                | CoordinatorError::SchedulerNotFound { .. }
                | CoordinatorError::NodeNotFound { .. }
                | CoordinatorError::BlobNotFound { .. }
        )
    }

    /// 是否为状态机冲突类错误
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidTransition { .. }
                | CoordinatorError::NotInProcessing { .. }
                | CoordinatorError::DecisionNotActive { .. }
                | CoordinatorError::JobAlreadyRunning { .. }
                | CoordinatorError::CapacityExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(CoordinatorError::TaskNotFound { id: 1 }.is_not_found());
        assert!(CoordinatorError::BlobNotFound {
            digest: "ab".to_string()
        }
        .is_not_found());
        assert!(!CoordinatorError::Timeout("lock".to_string()).is_not_found());
    }

    #[test]
    fn test_conflict_classification() {
        let err = CoordinatorError::InvalidTransition {
            task_id: 7,
            from: "FINISHED".to_string(),
            to: "PROCESSING".to_string(),
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "无效的状态转换: 任务 7 从 FINISHED 到 PROCESSING"
        );
        assert!(!CoordinatorError::InvariantViolation("x".to_string()).is_conflict());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CoordinatorError = json_err.into();
        assert!(matches!(err, CoordinatorError::Serialization(_)));
    }
}
