mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use coordinator_core::{models::TaskState, AppConfig, LockKey};
use coordinator_dispatcher::{CoordinatorServices, SweepReport};

use common::{node, register, running_decision, services_with, task_spec};

async fn sweeper_services() -> Result<CoordinatorServices> {
    let mut config = AppConfig::default();
    config.lifecycle.stuck_task_timeout_seconds = 60;
    config.registry.heartbeat_timeout_seconds = 90;
    services_with(config).await
}

#[tokio::test]
async fn test_stuck_task_requeued_exactly_once() -> Result<()> {
    let services = sweeper_services().await?;
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let decision = running_decision(&services).await?;
    services
        .lifecycle
        .create_tasks(decision.id, vec![task_spec(1)])
        .await?;
    let task = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();
    let now = Utc::now();

    // 还没有超时
    assert_eq!(services.sweeper.sweep_once(now).await?, SweepReport::default());

    // 超时，但调度器心跳仍然有效
    let report = services.sweeper.sweep_once(now + Duration::seconds(70)).await?;
    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped_alive, 1);
    assert_eq!(report.requeued, 0);

    // 调度器心跳也超时
    let later = now + Duration::seconds(120);
    let report = services.sweeper.sweep_once(later).await?;
    assert_eq!(report.requeued, 1);

    let requeued = services.lifecycle.task_status(task.id).await?;
    assert_eq!(requeued.state, TaskState::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.node_id.is_none());
    assert!(requeued.last_error.is_some());

    // 再扫一次不会重复处理
    let report = services.sweeper.sweep_once(later).await?;
    assert_eq!(report.examined, 0);
    assert_eq!(report.requeued, 0);

    let progress = services.progress.get(decision.id).await?;
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.processing, 0);
    assert_eq!(progress.retried, 1);

    // 资源已释放，任务可以被重新领取
    let views = services.registry.list().await?;
    assert_eq!(views[0].nodes[0].reserved.cpu_cores, 0);
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let reclaimed = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();
    assert_eq!(reclaimed.id, task.id);
    Ok(())
}

#[tokio::test]
async fn test_disconnected_scheduler_tasks_are_reclaimed() -> Result<()> {
    let services = sweeper_services().await?;
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let decision = running_decision(&services).await?;
    services
        .lifecycle
        .create_tasks(decision.id, vec![task_spec(1), task_spec(1)])
        .await?;
    let plain = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();
    let flagged = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();
    services.lifecycle.cancel_task(flagged.id).await?;

    let now = Utc::now();
    let expired = services.liveness.check_once(now + Duration::seconds(100)).await?;
    assert_eq!(expired.len(), 1);

    let report = services.sweeper.sweep_once(now + Duration::seconds(61)).await?;
    assert_eq!(report.requeued, 1);
    assert_eq!(report.cancelled, 1);
    assert_eq!(
        services.lifecycle.task_status(plain.id).await?.state,
        TaskState::Pending
    );
    assert_eq!(
        services.lifecycle.task_status(flagged.id).await?.state,
        TaskState::Cancelled
    );
    Ok(())
}

#[tokio::test]
async fn test_retry_limit_applies_to_sweep() -> Result<()> {
    let mut config = AppConfig::default();
    config.lifecycle.stuck_task_timeout_seconds = 60;
    config.lifecycle.max_retries = 0;
    let services = services_with(config).await?;
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let decision = running_decision(&services).await?;
    services
        .lifecycle
        .create_tasks(decision.id, vec![task_spec(1)])
        .await?;
    let task = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();

    let report = services
        .sweeper
        .sweep_once(Utc::now() + Duration::seconds(600))
        .await?;
    assert_eq!(report.failed, 1);
    assert_eq!(
        services.lifecycle.task_status(task.id).await?.state,
        TaskState::Error
    );
    Ok(())
}

#[tokio::test]
async fn test_sweeps_do_not_overlap() -> Result<()> {
    let services = sweeper_services().await?;
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let decision = running_decision(&services).await?;
    services
        .lifecycle
        .create_tasks(decision.id, vec![task_spec(1)])
        .await?;
    services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();

    let held = services
        .locks
        .try_acquire(&[LockKey::named("stuck-task-sweep")], "other-sweeper")
        .unwrap();
    let report = services
        .sweeper
        .sweep_once(Utc::now() + Duration::seconds(600))
        .await?;
    assert_eq!(report, SweepReport::default());

    drop(held);
    let report = services
        .sweeper
        .sweep_once(Utc::now() + Duration::seconds(600))
        .await?;
    assert_eq!(report.requeued, 1);
    Ok(())
}

#[tokio::test]
async fn test_pending_task_lost_from_queue_is_restored() -> Result<()> {
    let services = sweeper_services().await?;
    register(&services, "sch-1", &[node("node-1", 2)]).await?;
    let decision = running_decision(&services).await?;
    let task = services
        .lifecycle
        .create_tasks(decision.id, vec![task_spec(1)])
        .await?
        .remove(0);

    // 条目已出队，但进程在任务转为 PROCESSING 之前退出
    let node_view = services.registry.list().await?.remove(0).nodes.remove(0);
    let entry = services
        .queue
        .claim("default", &node_view.free_capabilities())
        .await?
        .unwrap();
    assert_eq!(entry.task_id, task.id);
    assert!(services.lifecycle.claim_next("sch-1", "node-1").await?.is_none());
    assert_eq!(
        services.lifecycle.task_status(task.id).await?.state,
        TaskState::Pending
    );

    // 宽限期内不动刚创建的任务
    let report = services.sweeper.sweep_once(Utc::now()).await?;
    assert_eq!(report.restored, 0);

    let later = Utc::now() + Duration::seconds(120);
    let report = services.sweeper.sweep_once(later).await?;
    assert_eq!(report.restored, 1);
    assert_eq!(services.queue.queue_size("default").await?, 1);

    // 已在队列中的任务不会被重复入队
    let report = services.sweeper.sweep_once(later).await?;
    assert_eq!(report.restored, 0);
    assert_eq!(services.queue.queue_size("default").await?, 1);

    let claimed = services.lifecycle.claim_next("sch-1", "node-1").await?.unwrap();
    assert_eq!(claimed.id, task.id);
    let progress = services.progress.get(decision.id).await?;
    assert_eq!(progress.pending, 0);
    assert_eq!(progress.processing, 1);
    Ok(())
}
