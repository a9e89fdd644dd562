//! # 任务统计聚合
//!
//! 上行流消息的最终落点: 抓取记录写入落库目标并累计result_count，
//! 日志写入日志驱动。落库目标（爬虫集合名）按任务缓存10分钟。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error};

use crawler_common::{SPIDER_KEY_FIELD, TASK_KEY_FIELD};
use crawler_domain::{LogStorage, RecordSink, Store};
use crawler_errors::{CrawlerError, CrawlerResult};

/// 落库目标缓存项
#[derive(Clone)]
struct DataTargetItem {
    spider_id: String,
    col_name: String,
    cached_at: Instant,
}

pub struct TaskStatsService {
    store: Store,
    log_storage: Arc<dyn LogStorage>,
    record_sink: Arc<dyn RecordSink>,
    targets: Mutex<HashMap<String, DataTargetItem>>,
    target_ttl: Duration,
}

impl TaskStatsService {
    pub fn new(
        store: Store,
        log_storage: Arc<dyn LogStorage>,
        record_sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            store,
            log_storage,
            record_sink,
            targets: Mutex::new(HashMap::new()),
            target_ttl: Duration::from_secs(600),
        }
    }

    #[cfg(test)]
    pub fn with_target_ttl(mut self, ttl: Duration) -> Self {
        self.target_ttl = ttl;
        self
    }

    /// 写入一批抓取记录
    ///
    /// 每条记录注入任务ID与爬虫ID后写入落库目标，并累计任务的抓取记录数。
    pub async fn insert_data(
        &self,
        task_id: &str,
        records: Vec<serde_json::Value>,
    ) -> CrawlerResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let target = self.get_target(task_id).await?;

        let enriched: Vec<serde_json::Value> = records
            .into_iter()
            .map(|mut record| {
                if let Some(obj) = record.as_object_mut() {
                    obj.insert(TASK_KEY_FIELD.to_string(), serde_json::json!(task_id));
                    obj.insert(
                        SPIDER_KEY_FIELD.to_string(),
                        serde_json::json!(target.spider_id),
                    );
                }
                record
            })
            .collect();

        let inserted = self
            .record_sink
            .insert_records(&target.col_name, &enriched)
            .await?;

        if inserted > 0 {
            self.store
                .task_stats
                .inc_result_count(task_id, inserted as i64)
                .await?;
        }
        debug!("任务 {} 写入 {} 条抓取记录", task_id, inserted);
        Ok(())
    }

    /// 写入一批日志行
    pub async fn insert_logs(&self, task_id: &str, lines: Vec<String>) -> CrawlerResult<()> {
        self.log_storage.write_lines(task_id, &lines).await
    }

    /// 解析任务的落库目标（带TTL缓存）
    async fn get_target(&self, task_id: &str) -> CrawlerResult<DataTargetItem> {
        {
            let mut targets = self.targets.lock().unwrap();
            if let Some(item) = targets.get_mut(task_id) {
                if item.cached_at.elapsed() < self.target_ttl {
                    item.cached_at = Instant::now();
                    return Ok(item.clone());
                }
            }
        }

        let task = self
            .store
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| CrawlerError::task_not_found(task_id))?;
        let spider = self
            .store
            .spiders
            .get_by_id(&task.spider_id)
            .await?
            .ok_or_else(|| CrawlerError::spider_not_found(&task.spider_id))?;

        let item = DataTargetItem {
            spider_id: spider.id.clone(),
            col_name: spider.col_name.clone(),
            cached_at: Instant::now(),
        };
        self.targets
            .lock()
            .unwrap()
            .insert(task_id.to_string(), item.clone());
        Ok(item)
    }

    /// 淘汰过期缓存项，返回淘汰数量
    pub fn evict_expired(&self) -> usize {
        let mut targets = self.targets.lock().unwrap();
        let before = targets.len();
        targets.retain(|_, item| item.cached_at.elapsed() < self.target_ttl);
        before - targets.len()
    }

    /// 缓存清理循环（每10分钟）
    pub async fn run_cleaner(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        debug!("淘汰 {} 条落库目标缓存", evicted);
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    /// 落库失败只记录日志，不中断上行流
    pub async fn handle_insert_data(&self, task_id: &str, data: serde_json::Value) {
        let records = match data {
            serde_json::Value::Array(items) => items,
            other => {
                error!("任务 {} 的抓取记录不是数组: {}", task_id, other);
                return;
            }
        };
        if let Err(e) = self.insert_data(task_id, records).await {
            error!("任务 {} 抓取记录落库失败: {}", task_id, e);
        }
    }

    pub async fn handle_insert_logs(&self, task_id: &str, data: serde_json::Value) {
        let lines: Vec<String> = match serde_json::from_value(data) {
            Ok(lines) => lines,
            Err(e) => {
                error!("任务 {} 的日志消息格式错误: {}", task_id, e);
                return;
            }
        };
        if let Err(e) = self.insert_logs(task_id, lines).await {
            error!("任务 {} 日志写入失败: {}", task_id, e);
        }
    }
}
