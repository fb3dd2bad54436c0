use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use coordinator_core::{
    models::{NodeCapabilities, ResourceRequest},
    traits::{QueueEntry, TaskQueue},
    CoordinatorError, CoordinatorResult,
};
use tokio::sync::Mutex;
use tracing::debug;

type EntryKey = (Reverse<i32>, i64);

/// 单个命名队列
///
/// 按能力类别分桶，每个桶内按 (优先级降序, 序号升序) 排序。
#[derive(Debug, Default)]
struct NamedQueue {
    classes: HashMap<String, BTreeMap<EntryKey, QueueEntry>>,
    index: HashMap<i64, (String, EntryKey)>,
}

impl NamedQueue {
    fn insert(&mut self, entry: QueueEntry) {
        let key = (Reverse(entry.priority), entry.sequence);
        self.index
            .insert(entry.task_id, (entry.capability_class.clone(), key));
        self.classes
            .entry(entry.capability_class.clone())
            .or_default()
            .insert(key, entry);
    }

    fn remove(&mut self, task_id: i64) -> Option<QueueEntry> {
        let (class, key) = self.index.remove(&task_id)?;
        let bucket = self.classes.get_mut(&class)?;
        let entry = bucket.remove(&key);
        if bucket.is_empty() {
            self.classes.remove(&class);
        }
        entry
    }

    /// 所有桶中第一个能放入剩余容量的条目里排序最靠前的一个
    fn best_fit(&self, capabilities: &NodeCapabilities) -> Option<i64> {
        self.classes
            .values()
            .filter_map(|bucket| {
                bucket
                    .iter()
                    .find(|(_, entry)| entry.resources.fits(capabilities))
            })
            .min_by_key(|(key, _)| **key)
            .map(|(_, entry)| entry.task_id)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// 内存任务队列实现
///
/// 进程重启后内容丢失，适用于测试和单进程部署。
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    queues: Mutex<HashMap<String, NamedQueue>>,
    next_sequence: AtomicI64,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_sequence: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        queue: &str,
        task_id: i64,
        priority: i32,
        resources: &ResourceRequest,
    ) -> CoordinatorResult<QueueEntry> {
        let mut queues = self.queues.lock().await;
        let named = queues.entry(queue.to_string()).or_default();
        if named.index.contains_key(&task_id) {
            return Err(CoordinatorError::TaskQueue(format!(
                "任务 {task_id} 已在队列 {queue} 中"
            )));
        }

        let entry = QueueEntry {
            task_id,
            queue: queue.to_string(),
            priority,
            capability_class: resources.capability_class(),
            resources: *resources,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Utc::now(),
        };
        named.insert(entry.clone());
        debug!("任务 {} 进入内存队列 {}", task_id, queue);
        Ok(entry)
    }

    async fn claim(
        &self,
        queue: &str,
        capabilities: &NodeCapabilities,
    ) -> CoordinatorResult<Option<QueueEntry>> {
        let mut queues = self.queues.lock().await;
        let Some(named) = queues.get_mut(queue) else {
            return Ok(None);
        };

        Ok(named
            .best_fit(capabilities)
            .and_then(|task_id| named.remove(task_id)))
    }

    async fn restore(&self, entry: &QueueEntry) -> CoordinatorResult<()> {
        let mut queues = self.queues.lock().await;
        let named = queues.entry(entry.queue.clone()).or_default();
        if !named.index.contains_key(&entry.task_id) {
            named.insert(entry.clone());
        }
        Ok(())
    }

    async fn remove(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .and_then(|named| named.remove(task_id))
            .is_some())
    }

    async fn contains(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .is_some_and(|named| named.index.contains_key(&task_id)))
    }

    async fn queue_size(&self, queue: &str) -> CoordinatorResult<u64> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn list_queues(&self) -> CoordinatorResult<Vec<String>> {
        let queues = self.queues.lock().await;
        let mut names: Vec<String> = queues
            .iter()
            .filter(|(_, q)| q.len() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
