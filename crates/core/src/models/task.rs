use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_sqlite_text_enum;
use crate::models::NodeCapabilities;

/// 任务：决策中最小的可调度工作单元
///
/// # 字段说明
///
/// - `queue`: 任务所在的命名队列，调度器从与其类型同名的队列中领取任务
/// - `priority`: 数值越大越先被领取，相同优先级按创建顺序
/// - `resources`: 资源需求，领取时必须能放入节点剩余容量
/// - `payload`: 生产者定义的不透明负载
/// - `node_id`/`scheduler_id`: 领取该任务的节点与调度器，仅在 `PROCESSING` 时有值
/// - `retry_count`: 已发生的失败次数（瞬时失败重新排队时累加）
/// - `output_digest`: 成功时的输出 Blob 摘要
/// - `progress`: 仅用于展示的进度信息，不影响状态
/// - `cancel_requested`: 协作式取消标志，执行中的 worker 需要轮询并响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub decision_id: i64,
    pub queue: String,
    pub priority: i32,
    pub resources: ResourceRequest,
    pub payload: TaskPayload,
    pub state: TaskState,
    pub scheduler_id: Option<String>,
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub output_digest: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub cancel_requested: bool,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Processing,
        TaskState::Finished,
        TaskState::Error,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Finished => "FINISHED",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    /// `ERROR` 在这里视为终态：重新排队是生命周期管理器的显式决定
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Error | TaskState::Cancelled
        )
    }

    /// 状态机允许的转换
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Processing)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Processing, TaskState::Finished)
                | (TaskState::Processing, TaskState::Error)
                | (TaskState::Processing, TaskState::Cancelled)
                | (TaskState::Error, TaskState::Pending)
        )
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "PROCESSING" => Ok(TaskState::Processing),
            "FINISHED" => Ok(TaskState::Finished),
            "ERROR" => Ok(TaskState::Error),
            "CANCELLED" => Ok(TaskState::Cancelled),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

impl_sqlite_text_enum!(TaskState);

/// 资源需求
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_time_seconds: Option<u64>,
    #[serde(default)]
    pub wall_time_seconds: Option<u64>,
}

impl ResourceRequest {
    pub fn new(cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            cpu_time_seconds: None,
            wall_time_seconds: None,
        }
    }

    /// 需求是否能放入给定的剩余容量
    pub fn fits(&self, capabilities: &NodeCapabilities) -> bool {
        self.cpu_cores <= capabilities.cpu_cores && self.memory_mb <= capabilities.memory_mb
    }

    /// 派生能力类别，队列内部按类别建立索引
    pub fn capability_class(&self) -> String {
        let cores = self.cpu_cores.max(1).next_power_of_two();
        let memory_gb = self.memory_mb.div_ceil(1024).max(1).next_power_of_two();
        format!("c{cores}m{memory_gb}")
    }
}

/// 生产者定义的不透明任务负载
///
/// 核心只理解 `input_digests`（用于 Blob 引用计数），其余内容原样转交给调度器。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskPayload {
    pub kind: String,
    #[serde(default)]
    pub input_digests: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// 任务成功时上报的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub output_digest: String,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

/// 任务实际资源消耗
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    pub cpu_time_seconds: f64,
    pub wall_time_seconds: f64,
    pub memory_mb: u64,
}

/// 生产者提交的任务描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    #[serde(default)]
    pub priority: i32,
    pub resources: ResourceRequest,
    pub payload: TaskPayload,
    /// 目标队列，缺省使用配置中的默认队列
    #[serde(default)]
    pub queue: Option<String>,
}

impl TaskSpec {
    pub fn new(priority: i32, resources: ResourceRequest, kind: &str) -> Self {
        Self {
            priority,
            resources,
            payload: TaskPayload {
                kind: kind.to_string(),
                input_digests: Vec::new(),
                parameters: serde_json::Value::Null,
            },
            queue: None,
        }
    }
}

/// worker 上报的失败
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    /// 基础设施类（可重试）故障，区别于任务自身的失败
    pub transient: bool,
}

impl Task {
    /// 领取到完成所经历的毫秒数
    pub fn processing_duration_ms(&self) -> Option<i64> {
        match (self.claimed_at, self.finished_at) {
            (Some(claimed), Some(finished)) => Some((finished - claimed).num_milliseconds().max(0)),
            _ => None,
        }
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id.as_deref() == Some(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Finished));
        assert!(Processing.can_transition_to(Error));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(Error.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Finished));
        assert!(!Finished.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Finished.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
    }

    #[test]
    fn test_state_text_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_resource_fit() {
        let request = ResourceRequest::new(2, 2048);
        assert!(request.fits(&NodeCapabilities {
            cpu_cores: 2,
            memory_mb: 4096
        }));
        assert!(!request.fits(&NodeCapabilities {
            cpu_cores: 1,
            memory_mb: 4096
        }));
        assert!(!request.fits(&NodeCapabilities {
            cpu_cores: 4,
            memory_mb: 1024
        }));
    }

    #[test]
    fn test_capability_class_buckets() {
        assert_eq!(ResourceRequest::new(1, 512).capability_class(), "c1m1");
        assert_eq!(ResourceRequest::new(3, 3000).capability_class(), "c4m4");
        assert_eq!(ResourceRequest::new(0, 0).capability_class(), "c1m1");
        assert_eq!(ResourceRequest::new(8, 16384).capability_class(), "c8m16");
    }
}
