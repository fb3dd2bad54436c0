use anyhow::Result;
use chrono::{Duration, Utc};
use coordinator_core::models::{
    BlobInfo, DecisionStatus, JobStatus, NodeCapacity, NodeSnapshot, NodeStatus, ProgressDelta,
    ResourceRequest, SchedulerStatus, TaskSpec, TaskState, Workload,
};
use coordinator_core::CoordinatorError;
use coordinator_infrastructure::DatabaseManager;

fn spec(cores: u32) -> TaskSpec {
    let mut spec = TaskSpec::new(0, ResourceRequest::new(cores, 1024), "verify");
    spec.queue = Some("default".to_string());
    spec
}

fn snapshot(id: &str, cores: u32, used: u32) -> NodeSnapshot {
    NodeSnapshot {
        id: id.to_string(),
        capacity: NodeCapacity {
            cpu_cores: cores,
            memory_mb: 8192,
        },
        workload: Workload {
            cpu_cores: used,
            memory_mb: 0,
            running_tasks: used,
        },
        healthy: true,
    }
}

#[tokio::test]
async fn test_decision_requires_inactive_job() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let jobs = db.job_repository();
    let decisions = db.decision_repository();

    let job = jobs.create_job("linux-drivers", None).await?;
    assert_eq!(job.status, JobStatus::NotStarted);

    let decision = decisions.create_decision(job.id, None).await?;
    assert_eq!(decision.status, DecisionStatus::Running);
    assert_eq!(
        jobs.get_job(job.id).await?.map(|j| j.status),
        Some(JobStatus::Running)
    );

    let err = decisions.create_decision(job.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::JobAlreadyRunning { decision_id, .. } if decision_id == decision.id
    ));

    decisions
        .update_decision_status(decision.id, DecisionStatus::Finished)
        .await?;
    let finished = decisions.get_decision(decision.id).await?.unwrap();
    assert!(finished.finished_at.is_some());
    assert!(decisions.active_decision_for_job(job.id).await?.is_none());

    // 前一个决策结束后可以开始新的决策
    decisions.create_decision(job.id, None).await?;
    Ok(())
}

#[tokio::test]
async fn test_decision_for_unknown_job() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let err = db
        .decision_repository()
        .create_decision(404, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::JobNotFound { id: 404 }));
    Ok(())
}

#[tokio::test]
async fn test_task_compare_and_update() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let tasks = db.task_repository();

    let created = tasks.insert_tasks(decision.id, &[spec(1), spec(2)]).await?;
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|t| t.state == TaskState::Pending));

    let mut task = created[0].clone();
    task.state = TaskState::Processing;
    task.node_id = Some("node-1".to_string());
    task.claimed_at = Some(Utc::now());
    assert!(tasks.compare_and_update(&task, TaskState::Pending).await?);

    // 第二个并发写入者看到的预期状态已经过期
    assert!(!tasks.compare_and_update(&task, TaskState::Pending).await?);

    let stored = tasks.get_task(task.id).await?.unwrap();
    assert_eq!(stored.state, TaskState::Processing);
    assert_eq!(stored.node_id.as_deref(), Some("node-1"));

    let non_terminal = tasks.list_non_terminal(decision.id).await?;
    assert_eq!(non_terminal.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_find_stuck_tasks() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let tasks = db.task_repository();
    let created = tasks.insert_tasks(decision.id, &[spec(1), spec(1)]).await?;

    let mut old = created[0].clone();
    old.state = TaskState::Processing;
    old.claimed_at = Some(Utc::now() - Duration::hours(2));
    tasks.compare_and_update(&old, TaskState::Pending).await?;

    let mut fresh = created[1].clone();
    fresh.state = TaskState::Processing;
    fresh.claimed_at = Some(Utc::now());
    tasks.compare_and_update(&fresh, TaskState::Pending).await?;

    let stuck = tasks.find_stuck(Utc::now() - Duration::hours(1)).await?;
    assert_eq!(stuck.iter().map(|t| t.id).collect::<Vec<_>>(), vec![old.id]);
    Ok(())
}

#[tokio::test]
async fn test_transition_commits_state_and_counters_together() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let tasks = db.task_repository();
    let progress = db.progress_repository();

    let created = tasks.insert_tasks(decision.id, &[spec(1), spec(1)]).await?;
    let counters = progress.get_progress(decision.id).await?.unwrap();
    assert_eq!(counters.total, 2);
    assert_eq!(counters.pending, 2);

    let mut claimed = created[0].clone();
    claimed.state = TaskState::Processing;
    claimed.claimed_at = Some(Utc::now());
    let delta = ProgressDelta::transition(TaskState::Pending, TaskState::Processing);
    let counters = tasks
        .transition(&claimed, TaskState::Pending, &delta)
        .await?
        .unwrap();
    assert_eq!(counters.pending, 1);
    assert_eq!(counters.processing, 1);

    // 状态已变，第二次转换既不写任务也不动计数器
    assert!(tasks
        .transition(&claimed, TaskState::Pending, &delta)
        .await?
        .is_none());
    let counters = progress.get_progress(decision.id).await?.unwrap();
    assert_eq!(counters.pending, 1);
    assert_eq!(counters.processing, 1);
    Ok(())
}

#[tokio::test]
async fn test_insert_tasks_without_counters_rolls_back() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    sqlx::query("DELETE FROM decision_progress WHERE decision_id = $1")
        .bind(decision.id)
        .execute(db.pool())
        .await?;

    let err = db
        .task_repository()
        .insert_tasks(decision.id, &[spec(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::DecisionNotFound { .. }));
    assert!(db
        .task_repository()
        .list_by_decision(decision.id)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_find_pending_tasks() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let tasks = db.task_repository();
    let created = tasks.insert_tasks(decision.id, &[spec(1), spec(1)]).await?;

    let mut claimed = created[1].clone();
    claimed.state = TaskState::Processing;
    tasks.compare_and_update(&claimed, TaskState::Pending).await?;

    assert!(tasks.find_pending(Utc::now() - Duration::hours(1)).await?.is_empty());
    let pending = tasks.find_pending(Utc::now() + Duration::seconds(1)).await?;
    assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![created[0].id]);
    Ok(())
}

#[tokio::test]
async fn test_task_inputs_and_cascade_delete() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let tasks = db.task_repository();

    let mut with_inputs = spec(1);
    with_inputs.payload.input_digests = vec!["a".repeat(64), "b".repeat(64)];
    tasks.insert_tasks(decision.id, &[with_inputs]).await?;
    assert_eq!(tasks.list_input_digests(decision.id).await?.len(), 2);

    db.decision_repository().delete_decision(decision.id).await?;
    assert!(tasks.list_by_decision(decision.id).await?.is_empty());
    assert!(db.progress_repository().get_progress(decision.id).await?.is_none());
    assert!(db.decision_repository().get_decision(decision.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_progress_delta_is_incremental() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let job = db.job_repository().create_job("job", None).await?;
    let decision = db.decision_repository().create_decision(job.id, None).await?;
    let progress = db.progress_repository();

    progress
        .apply_delta(decision.id, &ProgressDelta::created(3))
        .await?;
    progress
        .apply_delta(
            decision.id,
            &ProgressDelta::transition(TaskState::Pending, TaskState::Processing),
        )
        .await?;
    let counters = progress
        .apply_delta(
            decision.id,
            &ProgressDelta::transition(TaskState::Processing, TaskState::Finished)
                .with_duration(Some(2000)),
        )
        .await?;

    assert_eq!(counters.total, 3);
    assert_eq!(counters.pending, 2);
    assert_eq!(counters.finished, 1);
    assert_eq!(counters.finished_duration_ms, 2000);
    assert_eq!(counters.eta_seconds(), Some(4.0));

    let err = progress
        .apply_delta(999, &ProgressDelta::created(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::DecisionNotFound { id: 999 }));
    Ok(())
}

#[tokio::test]
async fn test_reserve_stays_within_capacity() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let registry = db.registry_repository();
    let now = Utc::now();
    registry.upsert_scheduler("sch-1", "default", now).await?;
    registry
        .replace_nodes("sch-1", &[snapshot("node-1", 2, 0)], now)
        .await?;

    let one = ResourceRequest::new(1, 1024);
    let two = ResourceRequest::new(2, 1024);
    assert!(registry.try_reserve("node-1", &one).await?);
    assert!(!registry.try_reserve("node-1", &two).await?);
    assert!(registry.try_reserve("node-1", &one).await?);
    assert!(!registry.try_reserve("node-1", &one).await?);

    registry.release("node-1", &one).await?;
    let node = registry.get_node("node-1").await?.unwrap();
    assert_eq!(node.reserved.cpu_cores, 1);
    assert_eq!(node.reserved.running_tasks, 1);
    assert_eq!(node.workload.cpu_cores, 0);

    // 多余的释放会被截断为零
    registry.release("node-1", &two).await?;
    let node = registry.get_node("node-1").await?.unwrap();
    assert_eq!(node.reserved.cpu_cores, 0);
    assert_eq!(node.reserved.running_tasks, 0);
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_keeps_reservations() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let registry = db.registry_repository();
    let now = Utc::now();
    registry.upsert_scheduler("sch-1", "default", now).await?;
    registry
        .replace_nodes("sch-1", &[snapshot("node-1", 2, 0)], now)
        .await?;

    let two = ResourceRequest::new(2, 1024);
    assert!(registry.try_reserve("node-1", &two).await?);

    // worker 还没开始运行，心跳上报的负载仍为零
    let nodes = registry
        .replace_nodes("sch-1", &[snapshot("node-1", 2, 0)], now)
        .await?;
    assert_eq!(nodes[0].reserved.cpu_cores, 2);
    assert_eq!(nodes[0].free_capabilities().cpu_cores, 0);
    assert!(!registry.try_reserve("node-1", &two).await?);

    // 上报负载高于预留时以上报为准
    registry.release("node-1", &two).await?;
    registry
        .replace_nodes("sch-1", &[snapshot("node-1", 2, 1)], now)
        .await?;
    assert!(!registry.try_reserve("node-1", &two).await?);
    assert!(registry.try_reserve("node-1", &ResourceRequest::new(1, 1024)).await?);
    Ok(())
}

#[tokio::test]
async fn test_replace_nodes_is_authoritative() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let registry = db.registry_repository();
    let now = Utc::now();
    registry.upsert_scheduler("sch-1", "default", now).await?;
    registry
        .replace_nodes(
            "sch-1",
            &[snapshot("node-1", 4, 0), snapshot("node-2", 4, 0)],
            now,
        )
        .await?;

    let nodes = registry
        .replace_nodes("sch-1", &[snapshot("node-2", 8, 3)], now)
        .await?;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].capacity.cpu_cores, 8);
    assert_eq!(nodes[0].workload.cpu_cores, 3);
    assert!(registry.get_node("node-1").await?.is_none());

    let scheduler = registry.get_scheduler("sch-1").await?.unwrap();
    assert_eq!(scheduler.node_ids, vec!["node-2".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_unhealthy_or_unreachable_node_cannot_reserve() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let registry = db.registry_repository();
    let now = Utc::now();
    registry.upsert_scheduler("sch-1", "default", now).await?;
    let mut sick = snapshot("node-1", 4, 0);
    sick.healthy = false;
    registry.replace_nodes("sch-1", &[sick], now).await?;
    assert!(!registry.try_reserve("node-1", &ResourceRequest::new(1, 1)).await?);

    registry
        .replace_nodes("sch-1", &[snapshot("node-1", 4, 0)], now)
        .await?;
    registry
        .set_nodes_status("sch-1", NodeStatus::Unreachable)
        .await?;
    assert!(!registry.try_reserve("node-1", &ResourceRequest::new(1, 1)).await?);
    Ok(())
}

#[tokio::test]
async fn test_expired_schedulers() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let registry = db.registry_repository();
    let now = Utc::now();
    registry
        .upsert_scheduler("old", "default", now - Duration::minutes(10))
        .await?;
    registry.upsert_scheduler("new", "default", now).await?;

    let expired = registry
        .find_expired_schedulers(now - Duration::seconds(90))
        .await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, "old");

    registry
        .set_scheduler_status("old", SchedulerStatus::Disconnected)
        .await?;
    assert!(registry
        .find_expired_schedulers(now - Duration::seconds(90))
        .await?
        .is_empty());

    assert!(registry.touch_heartbeat("old", now).await?);
    assert_eq!(
        registry.get_scheduler("old").await?.unwrap().status,
        SchedulerStatus::Connected
    );
    assert!(!registry.touch_heartbeat("ghost", now).await?);
    Ok(())
}

#[tokio::test]
async fn test_zero_ref_blob_row_cannot_be_revived() -> Result<()> {
    let db = DatabaseManager::in_memory().await?;
    let blobs = db.blob_repository();
    let digest = "c".repeat(64);
    let blob = BlobInfo {
        digest: digest.clone(),
        size: 3,
        location: "by-digest/cc/old".to_string(),
        ref_count: 1,
        created_at: Utc::now(),
    };
    blobs.insert_blob(&blob).await?;
    assert!(!blobs.delete_if_unreferenced(&digest).await?);
    assert_eq!(blobs.decrement_ref(&digest).await?, Some(0));

    // 删除中途失败留下的零引用行：不能再被引用，但可以被新内容覆盖
    assert_eq!(blobs.increment_ref(&digest).await?, None);
    let replacement = BlobInfo {
        location: "by-digest/cc/new".to_string(),
        ..blob.clone()
    };
    blobs.insert_blob(&replacement).await?;
    let stored = blobs.get_blob(&digest).await?.unwrap();
    assert_eq!(stored.ref_count, 1);
    assert_eq!(stored.location, "by-digest/cc/new");

    // 仍被引用的行不会被覆盖
    assert!(matches!(
        blobs.insert_blob(&blob).await,
        Err(CoordinatorError::InvariantViolation(_))
    ));

    assert_eq!(blobs.decrement_ref(&digest).await?, Some(0));
    assert!(blobs.delete_if_unreferenced(&digest).await?);
    assert!(blobs.get_blob(&digest).await?.is_none());
    Ok(())
}
