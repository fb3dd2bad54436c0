//! # coordinator-dispatcher
//!
//! 协调器的业务流程：调度器/节点注册表、任务生命周期、决策管理、
//! 进度聚合，以及两个周期性后台服务（卡住任务扫描、调度器存活监测）。

pub mod decision_service;
pub mod lifecycle;
pub mod periodic;
pub mod progress;
pub mod registry;
pub mod scheduler_liveness;
pub mod services;
pub mod stuck_task_sweeper;

pub use decision_service::DecisionService;
pub use lifecycle::{LifecycleComponents, TaskLifecycleManager};
pub use periodic::{LoopControl, PeriodicService};
pub use progress::ProgressAggregator;
pub use registry::{SchedulerRegistry, SchedulerView};
pub use scheduler_liveness::SchedulerLivenessMonitor;
pub use services::CoordinatorServices;
pub use stuck_task_sweeper::{StuckTaskSweeper, StuckTaskSweeperConfig, SweepReport};
