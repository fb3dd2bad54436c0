#![allow(dead_code)]

use coordinator_core::{
    models::{Decision, NodeCapacity, NodeSnapshot, ResourceRequest, TaskSpec, Workload},
    AppConfig,
};
use coordinator_dispatcher::CoordinatorServices;

pub async fn services() -> anyhow::Result<CoordinatorServices> {
    services_with(AppConfig::default()).await
}

pub async fn services_with(config: AppConfig) -> anyhow::Result<CoordinatorServices> {
    Ok(CoordinatorServices::in_memory(config).await?)
}

pub fn node(id: &str, cpu_cores: u32) -> NodeSnapshot {
    NodeSnapshot {
        id: id.to_string(),
        capacity: NodeCapacity {
            cpu_cores,
            memory_mb: 16 * 1024,
        },
        workload: Workload::default(),
        healthy: true,
    }
}

/// 注册一个 default 类型的调度器并上报节点
pub async fn register(
    services: &CoordinatorServices,
    scheduler_id: &str,
    nodes: &[NodeSnapshot],
) -> anyhow::Result<()> {
    services
        .registry
        .register(Some(scheduler_id), "default")
        .await?;
    services.registry.heartbeat(scheduler_id, nodes).await?;
    Ok(())
}

pub async fn running_decision(services: &CoordinatorServices) -> anyhow::Result<Decision> {
    let job = services.decisions.create_job("benchmark", None).await?;
    Ok(services.decisions.start_decision(job.id, None).await?)
}

pub fn task_spec(cpu_cores: u32) -> TaskSpec {
    TaskSpec::new(0, ResourceRequest::new(cpu_cores, 1024), "verify")
}
