//! # 任务派发与取消控制
//!
//! 把一次逻辑运行翻译为一个或多个任务行，以及把取消请求送达执行方。
//! 取消保证: 无论信号能否送达，非终态任务最终都会被驱动到终态，
//! 数据库是唯一事实来源。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crawler_common::NIL_ID;
use crawler_domain::{
    LocalTaskCanceller, RunMode, SpiderRunOptions, Store, Task, TaskStat, TaskStatus,
};
use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{SubscribeCode, SubscribeFrame};

use crate::registry::SubscriptionRegistry;

/// 取消信号发送超时
const CANCEL_SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// 强制取消后复核状态前的等待
const FORCE_CANCEL_VERIFY_DELAY: Duration = Duration::from_secs(5);

pub struct TaskDispatchService {
    store: Store,
    subscriptions: Arc<SubscriptionRegistry>,
    /// 主节点内嵌工作服务的取消入口，组合根注入
    local_canceller: RwLock<Option<Arc<dyn LocalTaskCanceller>>>,
    /// 测试钩子: 强制取消复核前的等待时间
    force_verify_delay: Duration,
}

impl TaskDispatchService {
    pub fn new(store: Store, subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self {
            store,
            subscriptions,
            local_canceller: RwLock::new(None),
            force_verify_delay: FORCE_CANCEL_VERIFY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_force_verify_delay(mut self, delay: Duration) -> Self {
        self.force_verify_delay = delay;
        self
    }

    pub async fn set_local_canceller(&self, canceller: Arc<dyn LocalTaskCanceller>) {
        *self.local_canceller.write().await = Some(canceller);
    }

    /// 把一次逻辑运行展开为任务行
    ///
    /// - random: 1个任务，任意节点领取
    /// - all: 每个活跃节点各1个任务
    /// - selected-nodes: 指定节点各1个任务
    pub async fn dispatch(
        &self,
        spider_id: &str,
        opts: &SpiderRunOptions,
    ) -> CrawlerResult<Vec<String>> {
        let spider = self
            .store
            .spiders
            .get_by_id(spider_id)
            .await?
            .ok_or_else(|| CrawlerError::spider_not_found(spider_id))?;

        let node_ids: Vec<String> = match opts.mode {
            RunMode::Random => vec![NIL_ID.to_string()],
            RunMode::AllNodes => {
                let nodes = self.store.nodes.get_active_nodes().await?;
                if nodes.is_empty() {
                    return Err(CrawlerError::unavailable("没有活跃节点可以执行任务"));
                }
                nodes.into_iter().map(|n| n.id).collect()
            }
            RunMode::SelectedNodes => {
                if opts.node_ids.is_empty() {
                    return Err(CrawlerError::invalid_input(
                        "selected-nodes模式必须指定节点列表",
                    ));
                }
                opts.node_ids.clone()
            }
        };

        let mut task_ids = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let mut task = Task::new(spider.id.clone(), opts);
            task.node_id = node_id;
            let task = self.enqueue(task).await?;
            task_ids.push(task.id);
        }

        info!(
            "爬虫 {} 派发 {} 个任务 (mode={})",
            spider_id,
            task_ids.len(),
            opts.mode.as_str()
        );
        Ok(task_ids)
    }

    /// 入列一个待执行任务（同时创建统计行）
    pub async fn enqueue(&self, task: Task) -> CrawlerResult<Task> {
        self.store.tasks.create(&task).await?;
        let stat = TaskStat::new(task.id.clone());
        if let Err(e) = self.store.task_stats.create(&stat).await {
            error!("创建任务统计失败: {} - {}", task.id, e);
            return Err(e);
        }
        Ok(task)
    }

    /// 取消任务
    ///
    /// 无论信号送达与否，返回成功时任务必然处于终态。
    pub async fn cancel(&self, task_id: &str, by: &str, force: bool) -> CrawlerResult<()> {
        let task = self
            .store
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| CrawlerError::task_not_found(task_id))?;

        // 终态任务不再变更，取消视为幂等成功
        if task.status.is_terminal() {
            info!("任务 {} 已处于终态 {}，忽略取消", task_id, task.status);
            return Ok(());
        }

        // 未被领取的任务直接取消
        if task.status == TaskStatus::Pending {
            self.store
                .tasks
                .update_status(task_id, TaskStatus::Cancelled, "", by)
                .await?;
            info!("待执行任务已取消: {}", task_id);
            return Ok(());
        }

        // 判断任务所在节点是否为主节点
        let is_master_task = match self.is_master_node(&task).await {
            Ok(v) => v,
            Err(e) => {
                error!("无法确认任务 {} 所在节点: {}", task_id, e);
                self.store
                    .tasks
                    .update_status(task_id, TaskStatus::Abnormal, &e.to_string(), by)
                    .await?;
                return Ok(());
            }
        };

        if is_master_task {
            self.cancel_on_master(&task, by, force).await
        } else {
            self.cancel_on_worker(&task, by, force).await
        }
    }

    async fn is_master_node(&self, task: &Task) -> CrawlerResult<bool> {
        if task.node_id.is_empty() {
            return Err(CrawlerError::internal(format!(
                "任务 {} 没有指派节点",
                task.id
            )));
        }
        let node = self
            .store
            .nodes
            .get_by_id(&task.node_id)
            .await?
            .ok_or_else(|| CrawlerError::node_not_found(&task.node_id))?;
        Ok(node.is_master)
    }

    /// 主节点本地取消: 直接调用内嵌工作服务
    async fn cancel_on_master(&self, task: &Task, by: &str, force: bool) -> CrawlerResult<()> {
        let canceller = self.local_canceller.read().await.clone();
        match canceller {
            Some(canceller) => {
                if let Err(e) = canceller.cancel(&task.id, force).await {
                    error!("主节点本地取消失败: {} - {}", task.id, e);
                    return Err(e);
                }
                self.store
                    .tasks
                    .update_status(&task.id, TaskStatus::Cancelled, "", by)
                    .await
            }
            None => {
                // 未注入本地取消入口时回退到订阅流路径
                self.cancel_on_worker(task, by, force).await
            }
        }
    }

    /// 远端取消: 通过任务订阅流发送取消帧
    async fn cancel_on_worker(&self, task: &Task, by: &str, force: bool) -> CrawlerResult<()> {
        let sender = match self.subscriptions.get(&task.id) {
            Some(sender) => sender,
            None => {
                warn!("任务 {} 没有下行流，可能已结束或连接丢失", task.id);
                self.store
                    .tasks
                    .update_status(
                        &task.id,
                        TaskStatus::Cancelled,
                        "cancel signal could not be delivered - stream not found",
                        by,
                    )
                    .await?;
                return Ok(());
            }
        };

        let frame = SubscribeFrame {
            code: SubscribeCode::Cancel,
            task_id: task.id.clone(),
            force,
        };
        let send_result =
            tokio::time::timeout(CANCEL_SEND_TIMEOUT, sender.send(frame)).await;

        match send_result {
            Ok(Ok(())) => {
                info!("任务 {} 的取消信号已发送 (force={})", task.id, force);
            }
            Ok(Err(e)) => {
                error!("任务 {} 取消信号发送失败: {}", task.id, e);
                self.store
                    .tasks
                    .update_status(
                        &task.id,
                        TaskStatus::Cancelled,
                        "cancel signal delivery failed",
                        by,
                    )
                    .await?;
                return Ok(());
            }
            Err(_) => {
                error!("任务 {} 取消信号发送超时", task.id);
                self.store
                    .tasks
                    .update_status(
                        &task.id,
                        TaskStatus::Cancelled,
                        "cancel signal delivery timeout",
                        by,
                    )
                    .await?;
                return Ok(());
            }
        }

        // 强制取消: 复核执行方是否真的停了，没停就由主节点直接改写终态
        if force {
            tokio::time::sleep(self.force_verify_delay).await;
            if let Some(current) = self.store.tasks.get_by_id(&task.id).await? {
                if current.status == TaskStatus::Running {
                    warn!("任务 {} 强制取消后仍在运行，直接改写为已取消", task.id);
                    self.store
                        .tasks
                        .update_status(
                            &task.id,
                            TaskStatus::Cancelled,
                            "forced cancellation - task was unresponsive",
                            by,
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler_domain::Node;
    use crawler_infrastructure::{migrate, sqlite_store};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (TaskDispatchService, Store, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        let store = sqlite_store(pool);

        let spider = crawler_domain::Spider::new("demo", "echo hi");
        store.spiders.create(&spider).await.unwrap();

        let svc = TaskDispatchService::new(
            store.clone(),
            Arc::new(SubscriptionRegistry::new()),
        )
        .with_force_verify_delay(Duration::from_millis(50));
        (svc, store, spider.id, dir)
    }

    #[tokio::test]
    async fn test_dispatch_random_creates_one_any_node_task() {
        let (svc, store, spider_id, _dir) = setup().await;

        let opts = SpiderRunOptions {
            mode: RunMode::Random,
            priority: 5,
            cmd: "echo hi".to_string(),
            ..Default::default()
        };
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();
        assert_eq!(ids.len(), 1);

        let task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.node_id, "");
        assert_eq!(task.priority, 5);
        // 统计行同时创建
        assert!(store.task_stats.get_by_id(&ids[0]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_all_nodes() {
        let (svc, store, spider_id, _dir) = setup().await;
        store.nodes.upsert(&Node::new("n1", "n1", true, 0)).await.unwrap();
        store.nodes.upsert(&Node::new("n2", "n2", false, 0)).await.unwrap();

        let opts = SpiderRunOptions {
            mode: RunMode::AllNodes,
            priority: 5,
            ..Default::default()
        };
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();
        assert_eq!(ids.len(), 2);

        for id in &ids {
            let task = store.tasks.get_by_id(id).await.unwrap().unwrap();
            assert!(!task.node_id.is_empty());
        }
    }

    #[tokio::test]
    async fn test_dispatch_selected_nodes_requires_ids() {
        let (svc, _store, spider_id, _dir) = setup().await;
        let opts = SpiderRunOptions {
            mode: RunMode::SelectedNodes,
            ..Default::default()
        };
        let err = svc.dispatch(&spider_id, &opts).await.unwrap_err();
        assert!(matches!(err, CrawlerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (svc, store, spider_id, _dir) = setup().await;
        let opts = SpiderRunOptions {
            priority: 5,
            ..Default::default()
        };
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();

        svc.cancel(&ids[0], "u1", false).await.unwrap();
        let task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_idempotent() {
        let (svc, store, spider_id, _dir) = setup().await;
        let opts = SpiderRunOptions::default();
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();
        store
            .tasks
            .update_status(&ids[0], TaskStatus::Cancelled, "", "u1")
            .await
            .unwrap();

        svc.cancel(&ids[0], "u1", false).await.unwrap();
        let task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_without_stream_marks_cancelled() {
        let (svc, store, spider_id, _dir) = setup().await;
        let node = store.nodes.upsert(&Node::new("w1", "w1", false, 0)).await.unwrap();

        let opts = SpiderRunOptions::default();
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();
        let mut task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        task.node_id = node.id.clone();
        task.status = TaskStatus::Running;
        store.tasks.update(&task).await.unwrap();

        // 没有下行流: 仍然驱动到终态
        svc.cancel(&ids[0], "u1", false).await.unwrap();
        let task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.contains("stream not found"));
    }

    #[tokio::test]
    async fn test_force_cancel_overwrites_unresponsive_task() {
        let (svc, store, spider_id, _dir) = setup().await;
        let node = store.nodes.upsert(&Node::new("w1", "w1", false, 0)).await.unwrap();

        let opts = SpiderRunOptions::default();
        let ids = svc.dispatch(&spider_id, &opts).await.unwrap();
        let mut task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        task.node_id = node.id.clone();
        task.status = TaskStatus::Running;
        store.tasks.update(&task).await.unwrap();

        // 挂一个下行流但对端不处理取消（任务状态保持running）
        let (tx, mut _rx) = tokio::sync::mpsc::channel(4);
        svc.subscriptions.add(&ids[0], tx);

        svc.cancel(&ids[0], "u1", true).await.unwrap();
        let task = store.tasks.get_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.contains("unresponsive"));
    }
}
