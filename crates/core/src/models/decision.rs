use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_sqlite_text_enum;
use crate::models::JobStatus;

/// 决策：作业的一次运行
///
/// 一个作业同时最多只能有一个活动决策（`RUNNING` 或 `CANCELLING`）。
/// `sealed` 表示生产者不会再提交新任务，此后最后一个任务进入终态时决策自动结束。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: i64,
    pub job_id: i64,
    pub configuration_digest: Option<String>,
    pub status: DecisionStatus,
    pub sealed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 决策状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DecisionStatus {
    #[serde(rename = "RUNNING")]
    Running,
    /// 已请求取消，等待所有任务到达终态
    #[serde(rename = "CANCELLING")]
    Cancelling,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Running => "RUNNING",
            DecisionStatus::Cancelling => "CANCELLING",
            DecisionStatus::Finished => "FINISHED",
            DecisionStatus::Failed => "FAILED",
            DecisionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DecisionStatus::Running | DecisionStatus::Cancelling)
    }

    /// 决策终态对应的作业状态
    pub fn job_status(&self) -> JobStatus {
        match self {
            DecisionStatus::Running | DecisionStatus::Cancelling => JobStatus::Running,
            DecisionStatus::Finished => JobStatus::Finished,
            DecisionStatus::Failed => JobStatus::Failed,
            DecisionStatus::Cancelled => JobStatus::Cancelled,
        }
    }
}

impl FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(DecisionStatus::Running),
            "CANCELLING" => Ok(DecisionStatus::Cancelling),
            "FINISHED" => Ok(DecisionStatus::Finished),
            "FAILED" => Ok(DecisionStatus::Failed),
            "CANCELLED" => Ok(DecisionStatus::Cancelled),
            _ => Err(format!("Invalid decision status: {s}")),
        }
    }
}

impl_sqlite_text_enum!(DecisionStatus);

impl Decision {
    /// 是否接受新任务
    pub fn accepts_tasks(&self) -> bool {
        self.status == DecisionStatus::Running && !self.sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_statuses() {
        assert!(DecisionStatus::Running.is_active());
        assert!(DecisionStatus::Cancelling.is_active());
        assert!(!DecisionStatus::Finished.is_active());
        assert!(!DecisionStatus::Cancelled.is_active());
    }

    #[test]
    fn test_sealed_decision_rejects_tasks() {
        let mut decision = Decision {
            id: 1,
            job_id: 1,
            configuration_digest: None,
            status: DecisionStatus::Running,
            sealed: false,
            started_at: Utc::now(),
            finished_at: None,
        };
        assert!(decision.accepts_tasks());
        decision.sealed = true;
        assert!(!decision.accepts_tasks());
    }
}
