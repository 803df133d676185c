//! 后台任务监管：记忆写入、摘要等响应后的副作用
//!
//! detach 立即返回，任务在独立 tokio 任务中执行，错误与 panic 都被捕获并只记录到诊断表；
//! 并发数受 Semaphore 限制（许可在任务内部获取，不阻塞调用方）。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

use crate::core::DetachedTaskError;

/// 诊断表最多保留的已结束任务数
const MAX_FINISHED_RECORDS: usize = 512;

/// 后台任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachedTaskKind {
    /// 对话消息写回上下文存储
    ContextAppend,
    /// 长期记忆写入
    MemoryWrite,
    /// 对话摘要
    Summarization,
}

/// 后台任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize)]
pub struct DetachedTaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl DetachedTaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DetachedStatus {
    /// 等待前置任务或并发许可
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Panicked(String),
}

impl DetachedStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DetachedStatus::Pending | DetachedStatus::Running)
    }
}

/// 单个后台任务的诊断记录
#[derive(Clone, Debug, Serialize)]
pub struct DetachedTaskRecord {
    pub id: DetachedTaskId,
    pub kind: DetachedTaskKind,
    pub label: String,
    pub status: DetachedStatus,
    pub scheduled_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 汇总统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// 后台任务监管器（可 Clone，多个运行共享同一实例）
#[derive(Clone)]
pub struct TaskSupervisor {
    semaphore: Arc<Semaphore>,
    records: Arc<Mutex<HashMap<DetachedTaskId, DetachedTaskRecord>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskSupervisor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            records: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// 调度一个后台任务并立即返回；任务的成败不会回传给调用方
    pub fn detach<F>(
        &self,
        kind: DetachedTaskKind,
        label: impl Into<String>,
        task: F,
    ) -> DetachedTaskId
    where
        F: Future<Output = Result<(), DetachedTaskError>> + Send + 'static,
    {
        self.detach_after(std::future::ready(()), kind, label, task)
    }

    /// 同 detach，但先等待 after 完成再申请并发许可（用于同一会话写入的先后顺序）
    pub fn detach_after<W, F>(
        &self,
        after: W,
        kind: DetachedTaskKind,
        label: impl Into<String>,
        task: F,
    ) -> DetachedTaskId
    where
        W: Future<Output = ()> + Send + 'static,
        F: Future<Output = Result<(), DetachedTaskError>> + Send + 'static,
    {
        let id = DetachedTaskId::next();
        let label = label.into();
        self.update(id, |records| {
            records.insert(
                id,
                DetachedTaskRecord {
                    id,
                    kind,
                    label: label.clone(),
                    status: DetachedStatus::Pending,
                    scheduled_at: Utc::now(),
                    finished_at: None,
                },
            );
        });
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        tokio::spawn(async move {
            after.await;
            let status = match Arc::clone(&this.semaphore).acquire_owned().await {
                Ok(_permit) => {
                    this.set_status(id, DetachedStatus::Running);
                    match AssertUnwindSafe(task).catch_unwind().await {
                        Ok(Ok(())) => DetachedStatus::Succeeded,
                        Ok(Err(e)) => {
                            tracing::warn!(task = %label, kind = ?kind, error = %e, "Detached task failed");
                            DetachedStatus::Failed(e.cause)
                        }
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            tracing::warn!(task = %label, kind = ?kind, panic = %msg, "Detached task panicked");
                            DetachedStatus::Panicked(msg)
                        }
                    }
                }
                Err(_) => DetachedStatus::Failed("supervisor closed".to_string()),
            };
            this.set_status(id, status);
            if this.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.idle.notify_waiters();
            }
        });

        id
    }

    /// 查询单个任务的状态
    pub fn status(&self, id: DetachedTaskId) -> Option<DetachedStatus> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(&id).map(|r| r.status.clone()))
    }

    /// 所有记录（按调度顺序）
    pub fn snapshot(&self) -> Vec<DetachedTaskRecord> {
        let mut list: Vec<DetachedTaskRecord> = self
            .records
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by_key(|r| r.id);
        list
    }

    pub fn stats(&self) -> SupervisorStats {
        let mut stats = SupervisorStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            ..Default::default()
        };
        for record in self.snapshot() {
            match record.status {
                DetachedStatus::Succeeded => stats.succeeded += 1,
                DetachedStatus::Failed(_) | DetachedStatus::Panicked(_) => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    /// 等待所有已调度任务结束（仅用于诊断、测试与进程退出前的收尾），超时返回 false
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    fn set_status(&self, id: DetachedTaskId, status: DetachedStatus) {
        self.update(id, |records| {
            if let Some(record) = records.get_mut(&id) {
                if status.is_finished() {
                    record.finished_at = Some(Utc::now());
                }
                record.status = status;
            }
            prune_finished(records);
        });
    }

    fn update(&self, id: DetachedTaskId, f: impl FnOnce(&mut HashMap<DetachedTaskId, DetachedTaskRecord>)) {
        match self.records.lock() {
            Ok(mut records) => f(&mut records),
            Err(_) => tracing::warn!(task_id = ?id, "Detached task records poisoned"),
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new(8)
    }
}

fn prune_finished(records: &mut HashMap<DetachedTaskId, DetachedTaskRecord>) {
    let mut finished: Vec<DetachedTaskId> = records
        .values()
        .filter(|r| r.status.is_finished())
        .map(|r| r.id)
        .collect();
    if finished.len() <= MAX_FINISHED_RECORDS {
        return;
    }
    finished.sort();
    let excess = finished.len() - MAX_FINISHED_RECORDS;
    for id in finished.into_iter().take(excess) {
        records.remove(&id);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detach_returns_before_task_completes() {
        let sup = TaskSupervisor::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let id = sup.detach(DetachedTaskKind::MemoryWrite, "slow write", async move {
            let _ = rx.await;
            Ok(())
        });
        assert!(!sup.status(id).unwrap().is_finished());
        tx.send(()).unwrap();
        assert!(sup.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(sup.status(id), Some(DetachedStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_detach_after_waits_without_holding_a_permit() {
        let sup = TaskSupervisor::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        // 后一个任务先调度，但必须排在前一个之后执行
        let second = Arc::clone(&order);
        sup.detach_after(
            async move {
                let _ = done_rx.await;
            },
            DetachedTaskKind::ContextAppend,
            "second",
            async move {
                second.lock().unwrap().push(2);
                Ok(())
            },
        );
        let first = Arc::clone(&order);
        sup.detach(DetachedTaskKind::ContextAppend, "first", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            first.lock().unwrap().push(1);
            let _ = done_tx.send(());
            Ok(())
        });

        assert!(sup.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(sup.stats().succeeded, 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let sup = TaskSupervisor::new(4);
        let failing = sup.detach(DetachedTaskKind::MemoryWrite, "write", async {
            Err(DetachedTaskError::new("write", "store unavailable"))
        });
        let panicking = sup.detach(DetachedTaskKind::ContextAppend, "append", async {
            panic!("boom");
        });
        let ok = sup.detach(DetachedTaskKind::Summarization, "summary", async { Ok(()) });

        assert!(sup.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(
            sup.status(failing),
            Some(DetachedStatus::Failed("store unavailable".into()))
        );
        assert_eq!(sup.status(panicking), Some(DetachedStatus::Panicked("boom".into())));
        assert_eq!(sup.status(ok), Some(DetachedStatus::Succeeded));

        let stats = sup.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let sup = TaskSupervisor::new(1);
        sup.detach(DetachedTaskKind::Summarization, "never", async {
            futures_util::future::pending::<()>().await;
            Ok(())
        });
        assert!(!sup.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(sup.stats().in_flight, 1);
    }
}
