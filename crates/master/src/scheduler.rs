//! # 调度计划服务
//!
//! 把启用的调度计划翻译为定时的任务入列事件。
//!
//! 关键顺序约束: Disable先落库再摘除cron条目，这样两步之间崩溃留下的
//! 状态是可对账的——对账循环只会重新注册启用的计划，绝不会让已停用的
//! 计划多触发一次。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crawler_domain::{Schedule, Store};
use crawler_errors::{CrawlerError, CrawlerResult};

use crate::cron_registry::CronRegistry;
use crate::dispatcher::TaskDispatchService;

pub struct ScheduleService {
    store: Store,
    dispatcher: Arc<TaskDispatchService>,
    registry: Arc<CronRegistry>,
    /// 对账间隔
    update_interval: Duration,
    /// Enable/Disable 的顺序保护
    mu: Mutex<()>,
}

impl ScheduleService {
    pub fn new(store: Store, dispatcher: Arc<TaskDispatchService>) -> Self {
        Self {
            store,
            dispatcher,
            registry: Arc::new(CronRegistry::new()),
            update_interval: Duration::from_secs(60),
            mu: Mutex::new(()),
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn registry(&self) -> Arc<CronRegistry> {
        self.registry.clone()
    }

    /// 启动时恢复: 注册所有启用的计划，表达式非法的计划自动停用
    pub async fn init(&self) -> CrawlerResult<()> {
        let schedules = self.store.schedules.get_enabled().await?;
        let total = schedules.len();
        for schedule in schedules {
            if CronRegistry::parse(&schedule.cron).is_err() {
                error!(
                    "调度计划 {} 的cron表达式非法: {}，自动停用",
                    schedule.id, schedule.cron
                );
                if let Err(e) = self.disable(&schedule, &schedule.updated_by).await {
                    error!("停用非法调度计划 {} 失败: {}", schedule.id, e);
                }
                continue;
            }
            if let Err(e) = self.enable(&schedule, &schedule.updated_by).await {
                error!("启动时注册调度计划 {} 失败: {}", schedule.id, e);
            }
        }
        info!("调度服务初始化完成，共加载 {} 个启用计划", total);
        Ok(())
    }

    /// 启动时钟循环与对账循环
    pub fn start(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) {
        let svc = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let fired = svc.registry.due(chrono::Utc::now());
                        for (_entry_id, schedule_id) in fired {
                            let svc = svc.clone();
                            tokio::spawn(async move {
                                svc.handle_fire(&schedule_id).await;
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("调度时钟循环退出");
                        return;
                    }
                }
            }
        });

        let svc = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(svc.update_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 第一个tick立即返回，跳过以免与init重复对账
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = svc.reconcile().await {
                            error!("调度计划对账失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("调度对账循环退出");
                        return;
                    }
                }
            }
        });
    }

    /// 启用计划: 校验表达式 → 注册cron条目 → 落库
    pub async fn enable(&self, schedule: &Schedule, by: &str) -> CrawlerResult<()> {
        let _guard = self.mu.lock().await;

        let entry_id = self.registry.add(&schedule.cron, &schedule.id)?;
        if let Err(e) = self
            .store
            .schedules
            .set_enabled(&schedule.id, true, entry_id, by)
            .await
        {
            // 落库失败时回收条目，维持 enabled ⇔ entry_id ≠ -1
            self.registry.remove(entry_id);
            return Err(e);
        }
        info!("调度计划已启用: {} entry_id={}", schedule.id, entry_id);
        Ok(())
    }

    /// 停用计划: 先落库，再摘除cron条目
    pub async fn disable(&self, schedule: &Schedule, by: &str) -> CrawlerResult<()> {
        let _guard = self.mu.lock().await;

        let entry_id = schedule.entry_id;
        self.store
            .schedules
            .set_enabled(&schedule.id, false, -1, by)
            .await?;
        if entry_id != -1 {
            self.registry.remove(entry_id);
        }
        info!("调度计划已停用: {}", schedule.id);
        Ok(())
    }

    /// 对账: 保证每个启用计划恰好对应一个活跃cron条目
    pub async fn reconcile(&self) -> CrawlerResult<()> {
        let schedules = self.store.schedules.get_enabled().await?;
        let mut live_entries = self.registry.entry_ids();

        for schedule in schedules {
            if live_entries.remove(&schedule.entry_id) {
                continue;
            }
            // 启用的计划没有对应条目: 重新注册（3次线性退避）
            if let Err(e) = self.enable_with_retry(&schedule, 3).await {
                error!("重新注册调度计划 {} 失败: {}", schedule.id, e);
            }
        }

        // 没有匹配到任何启用计划的条目一律摘除
        for entry_id in live_entries {
            warn!("摘除无主cron条目: {}", entry_id);
            self.registry.remove(entry_id);
        }
        Ok(())
    }

    async fn enable_with_retry(&self, schedule: &Schedule, max_retries: u32) -> CrawlerResult<()> {
        let mut last_err = None;
        for attempt in 0..max_retries {
            match self.enable(schedule, &schedule.updated_by).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "注册调度计划失败 (尝试 {}/{}): {} - {}",
                        attempt + 1,
                        max_retries,
                        schedule.id,
                        e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(attempt as u64 + 1)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CrawlerError::internal("注册调度计划失败")))
    }

    /// cron触发回调
    ///
    /// 重新加载计划确认仍然启用——用户可能在触发的同一时刻停用了计划。
    /// 已停用的计划在独立任务中摘除条目（避免与时钟循环重入），且不入列。
    pub async fn handle_fire(&self, schedule_id: &str) {
        debug!("调度计划触发: {}", schedule_id);

        let schedule = match self.store.schedules.get_by_id(schedule_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!("触发的调度计划不存在: {}", schedule_id);
                return;
            }
            Err(e) => {
                error!("加载调度计划 {} 失败: {}", schedule_id, e);
                return;
            }
        };

        if !schedule.enabled {
            warn!("调度计划 {} 已停用，跳过本次触发", schedule_id);
            let registry = self.registry.clone();
            let entry_id = schedule.entry_id;
            tokio::spawn(async move {
                if entry_id != -1 {
                    registry.remove(entry_id);
                }
            });
            return;
        }

        let spider = match self.store.spiders.get_by_id(&schedule.spider_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                error!(
                    "调度计划 {} 关联的爬虫不存在: {}",
                    schedule_id, schedule.spider_id
                );
                return;
            }
            Err(e) => {
                error!("加载爬虫 {} 失败: {}", schedule.spider_id, e);
                return;
            }
        };

        let opts = schedule.run_options(&spider);
        match self.dispatcher.dispatch(&spider.id, &opts).await {
            Ok(task_ids) => {
                info!(
                    "调度计划 {} 执行完成，创建 {} 个任务",
                    schedule_id,
                    task_ids.len()
                );
            }
            Err(e) => {
                error!("调度计划 {} 派发任务失败: {}", schedule_id, e);
            }
        }
    }
}
