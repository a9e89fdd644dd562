//! # 启动恢复与任务清理
//!
//! 主节点重启后，上一轮生命周期里的非终态任务无法再被跟踪，
//! 统一标记为abnormal（至少一次执行语义，不做跨重启恢复）。
//! 另有周期GC删除超过保留期的任务与统计。

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crawler_common::SYSTEM_USER;
use crawler_domain::{Store, TaskStatus};
use crawler_errors::CrawlerResult;

pub struct RecoveryService {
    store: Store,
    gc_interval: Duration,
    retention_days: i64,
}

impl RecoveryService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            gc_interval: Duration::from_secs(1800),
            retention_days: 30,
        }
    }

    pub fn with_gc(mut self, interval: Duration, retention_days: i64) -> Self {
        self.gc_interval = interval;
        self.retention_days = retention_days;
        self
    }

    /// 把所有非终态任务标记为abnormal，返回处理数量
    pub async fn mark_abnormal_tasks(&self) -> CrawlerResult<usize> {
        let stale = self
            .store
            .tasks
            .get_by_statuses(&[
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::Running,
            ])
            .await?;

        let count = stale.len();
        for task in stale {
            if let Err(e) = self
                .store
                .tasks
                .update_status(
                    &task.id,
                    TaskStatus::Abnormal,
                    "master restarted while task was in flight",
                    SYSTEM_USER,
                )
                .await
            {
                error!("标记异常任务失败: {} - {}", task.id, e);
            }
        }
        if count > 0 {
            warn!("主节点重启，{} 个未完成任务标记为abnormal", count);
        }
        Ok(count)
    }

    /// 清理一轮过期任务，返回删除数量
    pub async fn gc_once(&self) -> CrawlerResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        let ids = self.store.task_stats.get_ids_created_before(cutoff).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.tasks.delete_many(&ids).await?;
        self.store.task_stats.delete_many(&ids).await?;
        info!("清理 {} 个过期任务（{}天前）", ids.len(), self.retention_days);
        Ok(ids.len())
    }

    /// GC循环
    pub async fn run_gc(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.gc_once().await {
                        error!("任务GC失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("任务GC循环退出");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler_domain::{Spider, SpiderRunOptions, Task, TaskStat};
    use crawler_infrastructure::{migrate, sqlite_store};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (RecoveryService, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        let store = sqlite_store(pool);
        (RecoveryService::new(store.clone()), store, dir)
    }

    #[tokio::test]
    async fn test_mark_abnormal_only_non_terminal() {
        let (svc, store, _dir) = setup().await;
        let spider = Spider::new("demo", "echo hi");
        store.spiders.create(&spider).await.unwrap();

        let mut ids = Vec::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Finished,
        ] {
            let mut task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
            task.status = status;
            store.tasks.create(&task).await.unwrap();
            ids.push((task.id, status));
        }

        let marked = svc.mark_abnormal_tasks().await.unwrap();
        assert_eq!(marked, 3);

        for (id, original) in ids {
            let task = store.tasks.get_by_id(&id).await.unwrap().unwrap();
            if original == TaskStatus::Finished {
                assert_eq!(task.status, TaskStatus::Finished);
            } else {
                assert_eq!(task.status, TaskStatus::Abnormal);
            }
        }
    }

    #[tokio::test]
    async fn test_gc_removes_old_tasks() {
        let (svc, store, _dir) = setup().await;
        let spider = Spider::new("demo", "echo hi");
        store.spiders.create(&spider).await.unwrap();

        let mut old_task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
        old_task.status = TaskStatus::Finished;
        store.tasks.create(&old_task).await.unwrap();
        let old_stat = TaskStat {
            created_at: Utc::now() - chrono::Duration::days(40),
            ..TaskStat::new(old_task.id.clone())
        };
        store.task_stats.create(&old_stat).await.unwrap();

        let fresh_task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
        store.tasks.create(&fresh_task).await.unwrap();
        store
            .task_stats
            .create(&TaskStat::new(fresh_task.id.clone()))
            .await
            .unwrap();

        let removed = svc.gc_once().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.tasks.get_by_id(&old_task.id).await.unwrap().is_none());
        assert!(store.tasks.get_by_id(&fresh_task.id).await.unwrap().is_some());
    }
}
