use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_sqlite_text_enum;
use crate::models::ResourceRequest;

/// 调度器信息
///
/// 调度器是管理一组计算节点的外部进程，通过心跳维持存活状态。
/// `scheduler_type` 同时也是它领取任务的队列名。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerInfo {
    pub id: String,
    pub scheduler_type: String,
    pub status: SchedulerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub node_ids: Vec<String>,
}

/// 调度器连接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchedulerStatus {
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Connected => "CONNECTED",
            SchedulerStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl FromStr for SchedulerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(SchedulerStatus::Connected),
            "DISCONNECTED" => Ok(SchedulerStatus::Disconnected),
            _ => Err(format!("Invalid scheduler status: {s}")),
        }
    }
}

impl_sqlite_text_enum!(SchedulerStatus);

impl SchedulerInfo {
    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }

    /// 存活性由心跳时间推导，不依赖持久化的状态字段
    pub fn is_alive(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        !self.is_heartbeat_expired(now, timeout_seconds)
    }
}

/// 节点总容量
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// 节点当前负载
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Workload {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub running_tasks: u32,
}

/// 节点剩余可用容量，作为队列领取时的能力过滤条件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeCapabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// 节点健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "UNHEALTHY")]
    Unhealthy,
    /// 所属调度器失联
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Unhealthy => "UNHEALTHY",
            NodeStatus::Unreachable => "UNREACHABLE",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HEALTHY" => Ok(NodeStatus::Healthy),
            "UNHEALTHY" => Ok(NodeStatus::Unhealthy),
            "UNREACHABLE" => Ok(NodeStatus::Unreachable),
            _ => Err(format!("Invalid node status: {s}")),
        }
    }
}

impl_sqlite_text_enum!(NodeStatus);

/// 调度器心跳中上报的节点快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: String,
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub workload: Workload,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// 节点信息
///
/// `workload` 是调度器心跳上报的负载，`reserved` 是协调器为已领取任务预留的资源。
/// 两者分开保存，心跳不会抹掉预留；剩余容量按两者中较大的一方计算。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    pub scheduler_id: String,
    pub capacity: NodeCapacity,
    pub workload: Workload,
    #[serde(default)]
    pub reserved: Workload,
    pub status: NodeStatus,
    pub updated_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy)
    }

    /// 上报负载与预留中逐项取较大者
    pub fn effective_load(&self) -> Workload {
        Workload {
            cpu_cores: self.workload.cpu_cores.max(self.reserved.cpu_cores),
            memory_mb: self.workload.memory_mb.max(self.reserved.memory_mb),
            running_tasks: self.workload.running_tasks.max(self.reserved.running_tasks),
        }
    }

    /// 剩余容量；负载超过容量时按零计算
    pub fn free_capabilities(&self) -> NodeCapabilities {
        let load = self.effective_load();
        NodeCapabilities {
            cpu_cores: self.capacity.cpu_cores.saturating_sub(load.cpu_cores),
            memory_mb: self.capacity.memory_mb.saturating_sub(load.memory_mb),
        }
    }

    pub fn can_fit(&self, request: &ResourceRequest) -> bool {
        self.is_healthy() && request.fits(&self.free_capabilities())
    }

    /// 获取节点CPU负载率
    pub fn load_percentage(&self) -> f64 {
        if self.capacity.cpu_cores == 0 {
            0.0
        } else {
            (self.effective_load().cpu_cores as f64 / self.capacity.cpu_cores as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(cores: u32, used: u32) -> NodeInfo {
        NodeInfo {
            id: "node-1".to_string(),
            scheduler_id: "sch-1".to_string(),
            capacity: NodeCapacity {
                cpu_cores: cores,
                memory_mb: 8192,
            },
            workload: Workload {
                cpu_cores: used,
                memory_mb: 1024,
                running_tasks: used,
            },
            reserved: Workload::default(),
            status: NodeStatus::Healthy,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_free_capabilities() {
        let n = node(4, 1);
        let free = n.free_capabilities();
        assert_eq!(free.cpu_cores, 3);
        assert_eq!(free.memory_mb, 7168);
        assert!(n.can_fit(&ResourceRequest::new(3, 1024)));
        assert!(!n.can_fit(&ResourceRequest::new(4, 1024)));
        assert_eq!(n.load_percentage(), 25.0);
    }

    #[test]
    fn test_overloaded_node_has_no_free_capacity() {
        let n = node(2, 5);
        assert_eq!(n.free_capabilities().cpu_cores, 0);
    }

    #[test]
    fn test_reservations_count_against_free_capacity() {
        let mut n = node(4, 1);
        n.reserved = Workload {
            cpu_cores: 3,
            memory_mb: 512,
            running_tasks: 2,
        };
        // 预留 3 核高于上报的 1 核，内存则以上报的 1024 为准
        assert_eq!(n.free_capabilities().cpu_cores, 1);
        assert_eq!(n.free_capabilities().memory_mb, 7168);
        assert!(!n.can_fit(&ResourceRequest::new(2, 1)));
        assert_eq!(n.effective_load().running_tasks, 2);
    }

    #[test]
    fn test_unhealthy_node_fits_nothing() {
        let mut n = node(4, 0);
        n.status = NodeStatus::Unreachable;
        assert!(!n.can_fit(&ResourceRequest::new(1, 1)));
    }

    #[test]
    fn test_heartbeat_expiry() {
        let now = Utc::now();
        let scheduler = SchedulerInfo {
            id: "sch-1".to_string(),
            scheduler_type: "default".to_string(),
            status: SchedulerStatus::Connected,
            last_heartbeat: now - Duration::seconds(120),
            registered_at: now - Duration::hours(1),
            node_ids: vec![],
        };
        assert!(scheduler.is_heartbeat_expired(now, 90));
        assert!(!scheduler.is_alive(now, 90));
        assert!(scheduler.is_alive(now, 300));
    }
}
