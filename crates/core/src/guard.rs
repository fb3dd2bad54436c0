//! 并发守卫
//!
//! 以资源标识为粒度的命名咨询锁。`acquire` 接受一组键，只有当所有键都空闲时
//! 才一次性全部获得，返回的 [`LockGuard`] 在离开作用域时一并释放。
//!
//! 获取时阻塞等待（带超时），不会立即失败。超时返回 `Timeout`，
//! 错误信息中带有当前持有者的标签和持有时长。持有超过安全时限的锁
//! 只有在显式开启 `force_release` 时才会被强制释放，并以 error 级别记录。
//!
//! 锁的顺序约定：任务 → 节点 → 决策。持有决策锁时不再获取任务锁。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::{CoordinatorError, CoordinatorResult};

/// 锁键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(String);

impl LockKey {
    pub fn task(id: i64) -> Self {
        Self(format!("task:{id}"))
    }

    pub fn decision(id: i64) -> Self {
        Self(format!("decision:{id}"))
    }

    pub fn node(id: &str) -> Self {
        Self(format!("node:{id}"))
    }

    pub fn blob(digest: &str) -> Self {
        Self(format!("blob:{digest}"))
    }

    /// 单个命名临界区，例如周期任务的自互斥
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 锁管理器配置
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    pub acquire_timeout: Duration,
    pub safety_timeout: Duration,
    pub force_release: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(5000),
            safety_timeout: Duration::from_millis(10000),
            force_release: false,
        }
    }
}

/// 持有超过安全时限的锁
#[derive(Debug, Clone, PartialEq)]
pub struct LockDiagnostic {
    pub key: String,
    pub label: String,
    pub held_for: Duration,
}

#[derive(Debug, Clone)]
struct Holder {
    token: u64,
    label: String,
    acquired_at: Instant,
}

struct Inner {
    holders: Mutex<HashMap<LockKey, Holder>>,
    released: Notify,
    next_token: AtomicU64,
    config: LockManagerConfig,
}

impl Inner {
    fn holders(&self) -> MutexGuard<'_, HashMap<LockKey, Holder>> {
        // 持有者表只在短小的同步代码中修改，中毒时沿用内部数据
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, keys: &[LockKey], token: u64) {
        {
            let mut holders = self.holders();
            for key in keys {
                if holders.get(key).is_some_and(|h| h.token == token) {
                    holders.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// 命名锁管理器
///
/// 克隆开销很小，所有克隆共享同一张持有者表。
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

/// 锁守卫，离开作用域时释放全部键
pub struct LockGuard {
    inner: Arc<Inner>,
    keys: Vec<LockKey>,
    token: u64,
    label: String,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("keys", &self.keys)
            .field("label", &self.label)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.inner.release(&self.keys, self.token);
    }
}

struct Blocker {
    key: LockKey,
    token: u64,
    label: String,
    held_for: Duration,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                holders: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_token: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.inner.config
    }

    /// 阻塞获取一组键，超时返回 `Timeout`
    pub async fn acquire(&self, keys: &[LockKey], label: &str) -> CoordinatorResult<LockGuard> {
        let keys = normalize(keys);
        let config = &self.inner.config;
        let deadline = Instant::now() + config.acquire_timeout;

        loop {
            // 先登记唤醒，再检查，避免错过检查与等待之间的释放
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let blocker = match self.try_take(&keys, label) {
                Ok(guard) => return Ok(guard),
                Err(blocker) => blocker,
            };

            if config.force_release && blocker.held_for >= config.safety_timeout {
                self.force_release(&blocker);
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                let keys_text = join_keys(&keys);
                error!(
                    keys = %keys_text,
                    waiter = label,
                    holder = %blocker.label,
                    held_ms = blocker.held_for.as_millis() as u64,
                    "获取锁超时"
                );
                metrics::counter!("coordinator_lock_timeouts_total").increment(1);
                return Err(CoordinatorError::Timeout(format!(
                    "获取锁 [{keys_text}] 超时: {} 被 '{}' 持有 {}ms",
                    blocker.key,
                    blocker.label,
                    blocker.held_for.as_millis()
                )));
            }

            let mut wait = deadline - now;
            if config.force_release {
                wait = wait.min(config.safety_timeout.saturating_sub(blocker.held_for));
            }
            let _ = tokio::time::timeout(wait, released).await;
        }
    }

    /// 非阻塞获取，有任一键被占用时返回 None
    pub fn try_acquire(&self, keys: &[LockKey], label: &str) -> Option<LockGuard> {
        self.try_take(&normalize(keys), label).ok()
    }

    /// 是否有任一键被占用
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.inner.holders().contains_key(key)
    }

    /// 持有时间超过安全时限的锁
    pub fn overdue_locks(&self) -> Vec<LockDiagnostic> {
        let safety = self.inner.config.safety_timeout;
        let mut overdue: Vec<LockDiagnostic> = self
            .inner
            .holders()
            .iter()
            .filter_map(|(key, holder)| {
                let held_for = holder.acquired_at.elapsed();
                (held_for >= safety).then(|| LockDiagnostic {
                    key: key.to_string(),
                    label: holder.label.clone(),
                    held_for,
                })
            })
            .collect();
        overdue.sort_by(|a, b| a.key.cmp(&b.key));
        overdue
    }

    fn try_take(&self, keys: &[LockKey], label: &str) -> Result<LockGuard, Blocker> {
        let mut holders = self.inner.holders();

        if let Some((key, holder)) = keys
            .iter()
            .find_map(|key| holders.get(key).map(|holder| (key, holder)))
        {
            return Err(Blocker {
                key: key.clone(),
                token: holder.token,
                label: holder.label.clone(),
                held_for: holder.acquired_at.elapsed(),
            });
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let acquired_at = Instant::now();
        for key in keys {
            holders.insert(
                key.clone(),
                Holder {
                    token,
                    label: label.to_string(),
                    acquired_at,
                },
            );
        }
        debug!(keys = %join_keys(keys), label, "获取锁");

        Ok(LockGuard {
            inner: Arc::clone(&self.inner),
            keys: keys.to_vec(),
            token,
            label: label.to_string(),
        })
    }

    fn force_release(&self, blocker: &Blocker) {
        let released: Vec<LockKey> = {
            let mut holders = self.inner.holders();
            let keys: Vec<LockKey> = holders
                .iter()
                .filter(|(_, holder)| holder.token == blocker.token)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                holders.remove(key);
            }
            keys
        };

        if released.is_empty() {
            warn!(holder = %blocker.label, "待强制释放的锁已被释放");
            return;
        }

        error!(
            keys = %join_keys(&released),
            holder = %blocker.label,
            held_ms = blocker.held_for.as_millis() as u64,
            "锁持有超过安全时限，已强制释放，被保护的数据可能不一致"
        );
        metrics::counter!("coordinator_lock_force_releases_total").increment(1);
        self.inner.released.notify_waiters();
    }
}

fn normalize(keys: &[LockKey]) -> Vec<LockKey> {
    let mut keys = keys.to_vec();
    keys.sort();
    keys.dedup();
    keys
}

fn join_keys(keys: &[LockKey]) -> String {
    keys.iter()
        .map(LockKey::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(acquire_ms: u64, safety_ms: u64, force_release: bool) -> LockManager {
        LockManager::new(LockManagerConfig {
            acquire_timeout: Duration::from_millis(acquire_ms),
            safety_timeout: Duration::from_millis(safety_ms),
            force_release,
        })
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = manager(100, 1000, false);
        let key = LockKey::task(1);
        {
            let guard = locks.acquire(&[key.clone()], "test").await.unwrap();
            assert_eq!(guard.keys(), &[key.clone()]);
            assert!(locks.is_locked(&key));
        }
        assert!(!locks.is_locked(&key));
    }

    #[tokio::test]
    async fn test_multi_key_is_all_or_nothing() {
        let locks = manager(50, 1000, false);
        let _node = locks.acquire(&[LockKey::node("n1")], "holder").await.unwrap();

        let result = locks
            .acquire(&[LockKey::task(1), LockKey::node("n1")], "waiter")
            .await;
        assert!(matches!(result, Err(CoordinatorError::Timeout(_))));
        // 未拿到全部键时不能占用任何一个
        assert!(!locks.is_locked(&LockKey::task(1)));
    }

    #[tokio::test]
    async fn test_timeout_names_holder() {
        let locks = manager(30, 1000, false);
        let _guard = locks
            .acquire(&[LockKey::decision(9)], "cancel-decision")
            .await
            .unwrap();

        let err = locks
            .acquire(&[LockKey::decision(9)], "finalize")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("decision:9"));
        assert!(message.contains("cancel-decision"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_released() {
        let locks = manager(2000, 10000, false);
        let guard = locks.acquire(&[LockKey::task(5)], "first").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&[LockKey::task(5)], "second").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.label(), "second");
    }

    #[tokio::test]
    async fn test_force_release_only_when_enabled() {
        let locks = manager(500, 20, true);
        let stale = locks.acquire(&[LockKey::node("n1")], "leaked").await.unwrap();

        let fresh = locks.acquire(&[LockKey::node("n1")], "fresh").await.unwrap();
        assert_eq!(fresh.label(), "fresh");

        // 被强制释放的旧守卫析构时不能释放新持有者的锁
        drop(stale);
        assert!(locks.is_locked(&LockKey::node("n1")));
    }

    #[tokio::test]
    async fn test_overdue_locks_reported() {
        let locks = manager(100, 10, false);
        let _guard = locks.acquire(&[LockKey::blob("ab")], "slow").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let overdue = locks.overdue_locks();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].key, "blob:ab");
        assert_eq!(overdue[0].label, "slow");
    }

    #[test]
    fn test_try_acquire() {
        let locks = manager(100, 1000, false);
        let key = LockKey::named("stuck-task-sweep");
        let guard = locks.try_acquire(&[key.clone()], "sweep");
        assert!(guard.is_some());
        assert!(locks.try_acquire(&[key.clone()], "sweep").is_none());
        drop(guard);
        assert!(locks.try_acquire(&[key], "sweep").is_some());
    }

    #[test]
    fn test_duplicate_keys_are_merged() {
        let locks = manager(100, 1000, false);
        let guard = locks
            .try_acquire(&[LockKey::task(1), LockKey::task(1)], "dup")
            .unwrap();
        assert_eq!(guard.keys().len(), 1);
    }
}
