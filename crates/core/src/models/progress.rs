use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ResourceUsage, TaskState};

/// 决策进度计数器
///
/// 计数器增量维护：任务进入某状态时加一，离开时减一，每个事件 O(1)。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DecisionProgress {
    pub decision_id: i64,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub finished: i64,
    pub error: i64,
    pub cancelled: i64,
    /// 瞬时失败后重新排队的次数
    pub retried: i64,
    pub cpu_time_seconds: f64,
    pub wall_time_seconds: f64,
    pub memory_mb_peak: u64,
    /// 已完成任务处理时长之和
    pub finished_duration_ms: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// 单次状态转换对计数器的影响
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressDelta {
    pub from: Option<TaskState>,
    pub to: Option<TaskState>,
    pub count: i64,
    pub duration_ms: Option<i64>,
    pub usage: Option<ResourceUsage>,
}

impl ProgressDelta {
    /// 新建任务
    pub fn created(count: i64) -> Self {
        Self {
            from: None,
            to: Some(TaskState::Pending),
            count,
            ..Default::default()
        }
    }

    pub fn transition(from: TaskState, to: TaskState) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            count: 1,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration_ms: Option<i64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_usage(mut self, usage: Option<ResourceUsage>) -> Self {
        self.usage = usage;
        self
    }

    /// 任务被删除（决策级联删除时使用）
    pub fn removed(from: TaskState) -> Self {
        Self {
            from: Some(from),
            to: None,
            count: 1,
            ..Default::default()
        }
    }

    /// 是否为一次瞬时失败后的重新排队
    pub fn is_retry(&self) -> bool {
        matches!(
            (self.from, self.to),
            (Some(TaskState::Processing), Some(TaskState::Pending))
        )
    }
}

impl DecisionProgress {
    pub fn new(decision_id: i64) -> Self {
        Self {
            decision_id,
            ..Default::default()
        }
    }

    pub fn count(&self, state: TaskState) -> i64 {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Processing => self.processing,
            TaskState::Finished => self.finished,
            TaskState::Error => self.error,
            TaskState::Cancelled => self.cancelled,
        }
    }

    fn count_mut(&mut self, state: TaskState) -> &mut i64 {
        match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Processing => &mut self.processing,
            TaskState::Finished => &mut self.finished,
            TaskState::Error => &mut self.error,
            TaskState::Cancelled => &mut self.cancelled,
        }
    }

    /// 应用一次增量
    pub fn apply(&mut self, delta: &ProgressDelta) {
        if let Some(from) = delta.from {
            *self.count_mut(from) -= delta.count;
        }
        match delta.to {
            Some(to) => *self.count_mut(to) += delta.count,
            None => self.total -= delta.count,
        }
        if delta.from.is_none() {
            self.total += delta.count;
        }
        if delta.is_retry() {
            self.retried += delta.count;
        }
        if delta.to == Some(TaskState::Finished) {
            self.finished_duration_ms += delta.duration_ms.unwrap_or(0);
        }
        if let Some(usage) = delta.usage {
            self.cpu_time_seconds += usage.cpu_time_seconds;
            self.wall_time_seconds += usage.wall_time_seconds;
            self.memory_mb_peak = self.memory_mb_peak.max(usage.memory_mb);
        }
    }

    /// 未到达终态的任务数
    pub fn non_terminal(&self) -> i64 {
        self.pending + self.processing
    }

    pub fn terminal(&self) -> i64 {
        self.finished + self.error + self.cancelled
    }

    /// 预计剩余时间：已完成任务的平均处理时长乘以剩余任务数
    pub fn eta_seconds(&self) -> Option<f64> {
        if self.finished == 0 {
            return None;
        }
        let mean_ms = self.finished_duration_ms as f64 / self.finished as f64;
        Some(mean_ms * self.non_terminal() as f64 / 1000.0)
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            eta_seconds: self.eta_seconds(),
            completion_ratio: if self.total > 0 {
                self.terminal() as f64 / self.total as f64
            } else {
                0.0
            },
            counters: self.clone(),
        }
    }
}

/// 对外暴露的进度视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSummary {
    #[serde(flatten)]
    pub counters: DecisionProgress,
    pub eta_seconds: Option<f64>,
    pub completion_ratio: f64,
}
