//! # 任务处理服务
//!
//! 工作节点的"领取-执行"核心: 周期调用FetchTask领取任务，提交到任务池
//! 由Runner执行；维护运行中Runner的注册表，承接来自下行流与主节点本地
//! 调用的取消请求；周期上报本节点运行数并清理卡死任务。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crawler_config::AppConfig;
use crawler_domain::{LocalTaskCanceller, Notifier, Store, TaskStatus};
use crawler_errors::{CrawlerError, CrawlerResult};

use crate::connection::ConnectionSupervisor;
use crate::pool::{TaskExecutor, WorkerPool};
use crate::runner::{RunnerConfig, TaskRunner};
use crate::stream_manager::StreamManager;

/// 卡死任务清扫间隔
const STUCK_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// 取消状态下Runner仍存活的容忍时长
const STUCK_EVICT_AFTER: Duration = Duration::from_secs(900);
/// 单次取消操作的总超时
const CANCEL_OP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TaskHandlerService {
    store: Store,
    supervisor: Arc<ConnectionSupervisor>,
    notifier: Arc<dyn Notifier>,
    stream_manager: Arc<StreamManager>,

    node_key: String,
    fetch_interval: Duration,
    fetch_timeout: Duration,
    report_interval: Duration,
    runner_config: RunnerConfig,
    max_workers: i32,
    queue_size: usize,

    runners: Mutex<HashMap<String, Arc<TaskRunner>>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskHandlerService {
    pub fn new(
        config: &AppConfig,
        store: Store,
        supervisor: Arc<ConnectionSupervisor>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let stream_manager = StreamManager::new(
            supervisor.clone(),
            config.worker.max_streams,
            Duration::from_secs(config.worker.stream_recv_timeout_secs),
        );
        let runner_config = RunnerConfig {
            workspace: config.workspace.clone().into(),
            is_master: config.node.is_master,
            api_endpoint: config.master.api_endpoint(),
            auth_key: config.auth_key.clone(),
            tool_paths: config.worker.tool_paths.iter().map(Into::into).collect(),
            cancel_timeout: Duration::from_secs(config.worker.cancel_timeout_secs),
            terminate_grace: Duration::from_secs(config.worker.terminate_grace_secs),
            process_health_interval: Duration::from_secs(
                config.worker.process_health_interval_secs,
            ),
            conn_health_interval: Duration::from_secs(config.worker.conn_health_interval_secs),
            ..Default::default()
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            store,
            supervisor,
            notifier,
            stream_manager,
            node_key: config.node.key.clone(),
            fetch_interval: Duration::from_millis(config.worker.fetch_interval_ms),
            fetch_timeout: Duration::from_secs(config.worker.fetch_timeout_secs),
            report_interval: Duration::from_secs(config.worker.report_interval_secs),
            runner_config,
            max_workers: config.worker.max_workers,
            queue_size: config.worker.effective_queue_size(),
            runners: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// 启动领取循环、状态上报循环与卡死任务清扫
    pub async fn start(self: &Arc<Self>) {
        self.supervisor.wait_for_ready().await;

        let executor: Arc<dyn TaskExecutor> = self.clone();
        let pool = WorkerPool::new(executor, self.max_workers, self.queue_size);
        *self.pool.lock().unwrap() = Some(pool);

        let canceller: Arc<dyn LocalTaskCanceller> = self.clone();
        self.stream_manager.start(canceller).await;

        // 领取循环
        {
            let svc = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(svc.fetch_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = svc.fetch_cycle().await {
                                debug!("领取循环: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("领取循环退出");
                            return;
                        }
                    }
                }
            });
        }

        // 节点状态上报循环
        {
            let svc = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(svc.report_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = svc.report_node_status().await {
                                error!("节点状态上报失败: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("状态上报循环退出");
                            return;
                        }
                    }
                }
            });
        }

        // 卡死任务清扫
        {
            let svc = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STUCK_SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => svc.sweep_stuck_tasks().await,
                        _ = shutdown_rx.recv() => {
                            debug!("卡死任务清扫退出");
                            return;
                        }
                    }
                }
            });
        }

        info!("任务处理服务已启动: {}", self.node_key);
    }

    /// 停止: 取消所有运行中任务并等待协程退出
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("停止任务处理服务...");
        let _ = self.shutdown_tx.send(());

        if let Some(pool) = self.pool.lock().unwrap().clone() {
            pool.stop();
        }
        self.stream_manager.stop();

        // 逐个优雅取消运行中的任务
        let running: Vec<Arc<TaskRunner>> =
            self.runners.lock().unwrap().values().cloned().collect();
        for runner in running {
            if let Err(e) = runner.cancel(false).await {
                error!("停止时取消任务 {} 失败: {}", runner.task_id(), e);
                let _ = runner.cancel(true).await;
            }
        }
        info!("任务处理服务已停止");
    }

    pub fn runner_count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }

    /// 一轮领取: 门禁检查 → FetchTask → 提交任务池
    async fn fetch_cycle(&self) -> CrawlerResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CrawlerError::unavailable("服务已停止"));
        }

        let node = self
            .store
            .nodes
            .get_by_key(&self.node_key)
            .await?
            .ok_or_else(|| CrawlerError::node_not_found(&self.node_key))?;
        if !node.active || !node.enabled {
            return Err(CrawlerError::unavailable("节点未激活或已禁用"));
        }
        if node.max_runners > 0 && self.runner_count() >= node.max_runners as usize {
            return Err(CrawlerError::unavailable("达到节点最大并发数"));
        }

        let client = self.supervisor.task_client().await?;
        let task_id = tokio::time::timeout(self.fetch_timeout, client.fetch_task(&self.node_key))
            .await
            .map_err(|_| CrawlerError::timeout("FetchTask超时"))??;
        if task_id.is_empty() {
            return Ok(());
        }

        info!("领取到任务: {}", task_id);
        let pool = self
            .pool
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CrawlerError::unavailable("任务池未启动"))?;
        if let Err(e) = pool.submit(task_id.clone()) {
            // 已领取却无法执行的任务必须驱动到终态，不能悬在assigned
            error!("任务 {} 提交任务池失败: {}", task_id, e);
            let _ = self
                .store
                .tasks
                .update_status(&task_id, TaskStatus::Error, &e.to_string(), "worker")
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// 上报本节点当前运行任务数
    async fn report_node_status(&self) -> CrawlerResult<()> {
        let node = self
            .store
            .nodes
            .get_by_key(&self.node_key)
            .await?
            .ok_or_else(|| CrawlerError::node_not_found(&self.node_key))?;
        let count = self
            .store
            .tasks
            .count_by_node_statuses(&node.id, &[TaskStatus::Assigned, TaskStatus::Running])
            .await?;
        self.store
            .nodes
            .set_current_runners(&node.id, count as i32)
            .await
    }

    /// 清理卡死任务: 数据库已是cancelled但Runner仍在注册表里超过容忍时长
    async fn sweep_stuck_tasks(&self) {
        let runner_ids: Vec<String> = self.runners.lock().unwrap().keys().cloned().collect();
        for task_id in runner_ids {
            let task = match self.store.tasks.get_by_id(&task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    error!("卡死清扫加载任务 {} 失败: {}", task_id, e);
                    continue;
                }
            };
            let stuck = task.status == TaskStatus::Cancelled
                && (Utc::now() - task.updated_at).num_seconds()
                    > STUCK_EVICT_AFTER.as_secs() as i64;
            if !stuck {
                continue;
            }
            warn!("强制清理卡死任务: {}", task_id);
            if let Some(runner) = self.runners.lock().unwrap().remove(&task_id) {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.cleanup_orphans().await;
                });
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for TaskHandlerService {
    /// 任务池工作协程的执行入口: 构造Runner并运行到终态
    async fn execute_task(&self, task_id: &str) -> CrawlerResult<()> {
        {
            let runners = self.runners.lock().unwrap();
            if runners.contains_key(task_id) {
                return Err(CrawlerError::Conflict(format!("任务已在执行: {task_id}")));
            }
        }

        let runner = TaskRunner::new(
            task_id,
            self.store.clone(),
            self.supervisor.clone(),
            self.notifier.clone(),
            self.runner_config.clone(),
        )
        .await?;

        self.runners
            .lock()
            .unwrap()
            .insert(task_id.to_string(), runner.clone());

        // 下行流建立失败不阻塞执行，只是收不到远端取消信号
        if let Err(e) = self.stream_manager.add_task_stream(task_id).await {
            warn!("任务 {} 下行流建立失败: {}", task_id, e);
        }

        let result = runner.run().await;

        self.runners.lock().unwrap().remove(task_id);
        self.stream_manager.remove_task_stream(task_id);

        match result {
            Ok(status) => {
                debug!("任务 {} 执行结束: {}", task_id, status);
                Ok(())
            }
            Err(e) => {
                error!("任务 {} 执行异常: {}", task_id, e);
                // 执行异常也要驱动到终态，避免任务悬在running
                if let Ok(Some(task)) = self.store.tasks.get_by_id(task_id).await {
                    if !task.status.is_terminal() {
                        let _ = self
                            .store
                            .tasks
                            .update_status(task_id, TaskStatus::Error, &e.to_string(), "worker")
                            .await;
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl LocalTaskCanceller for TaskHandlerService {
    /// 取消本节点上的任务（下行流与主节点本地调用共用入口）
    async fn cancel(&self, task_id: &str, force: bool) -> CrawlerResult<()> {
        let runner = {
            let runners = self.runners.lock().unwrap();
            runners.get(task_id).cloned()
        };
        let Some(runner) = runner else {
            // Runner不存在: 任务可能已经结束
            warn!("取消时未找到任务 {} 的Runner", task_id);
            return Ok(());
        };

        match tokio::time::timeout(CANCEL_OP_TIMEOUT, runner.cancel(force)).await {
            Ok(Ok(())) => {
                info!("任务 {} 取消成功", task_id);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("任务 {} 取消失败: {}", task_id, e);
                if !force {
                    warn!("升级为强制取消: {}", task_id);
                    return self.cancel(task_id, true).await;
                }
                Err(e)
            }
            Err(_) => {
                error!("任务 {} 取消超时，移除Runner", task_id);
                self.runners.lock().unwrap().remove(task_id);
                Err(CrawlerError::CancelTimeout {
                    task_id: task_id.to_string(),
                })
            }
        }
    }
}
