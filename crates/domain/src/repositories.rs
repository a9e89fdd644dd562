//! # 仓储与外部协作者接口
//!
//! 所有持久化与外部副作用都通过这些trait注入，主从节点共用同一组接口。
//! 工作节点对共享存储的访问同样经由这些trait（参考实现为嵌入式SQLite）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crawler_errors::CrawlerResult;

use crate::entities::{
    EnvironmentVar, Node, Schedule, Spider, SpiderStat, Task, TaskStat, TaskStatus,
};

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> CrawlerResult<()>;
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Task>>;
    async fn update(&self, task: &Task) -> CrawlerResult<()>;
    /// 更新任务状态与错误信息
    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: &str,
        by: &str,
    ) -> CrawlerResult<()>;
    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> CrawlerResult<Vec<Task>>;
    /// 统计指定节点上处于给定状态的任务数
    async fn count_by_node_statuses(
        &self,
        node_id: &str,
        statuses: &[TaskStatus],
    ) -> CrawlerResult<i64>;
    /// 原子领取一个待执行任务
    ///
    /// 在单个事务内: 先按 (priority, id) 升序查找 `node_id = 节点` 的
    /// pending任务；没有时再查找 `node_id = ''`（任意节点）的pending任务并
    /// 把它指派给该节点。两个并发调用绝不会领到同一个任务。
    async fn claim_pending_task(&self, node_id: &str) -> CrawlerResult<Option<Task>>;
    async fn delete_many(&self, ids: &[String]) -> CrawlerResult<()>;
}

/// 任务统计仓储
#[async_trait]
pub trait TaskStatRepository: Send + Sync {
    async fn create(&self, stat: &TaskStat) -> CrawlerResult<()>;
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<TaskStat>>;
    async fn update(&self, stat: &TaskStat) -> CrawlerResult<()>;
    /// 累加抓取记录数
    async fn inc_result_count(&self, id: &str, n: i64) -> CrawlerResult<()>;
    /// 查询创建时间早于给定时刻的统计ID（任务GC使用）
    async fn get_ids_created_before(&self, t: DateTime<Utc>) -> CrawlerResult<Vec<String>>;
    async fn delete_many(&self, ids: &[String]) -> CrawlerResult<()>;
}

/// 爬虫仓储
#[async_trait]
pub trait SpiderRepository: Send + Sync {
    async fn create(&self, spider: &Spider) -> CrawlerResult<()>;
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Spider>>;
    async fn update(&self, spider: &Spider) -> CrawlerResult<()>;
}

/// 爬虫聚合统计仓储
#[async_trait]
pub trait SpiderStatRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<SpiderStat>>;
    /// 任务进入运行态: tasks+1, 累加等待时长，记录最近任务
    async fn apply_running(
        &self,
        spider_id: &str,
        task_id: &str,
        wait_duration_ms: i64,
    ) -> CrawlerResult<()>;
    /// 任务进入终态: 累加结果数与运行/总时长（秒），记录最近任务
    async fn apply_terminal(
        &self,
        spider_id: &str,
        task_id: &str,
        result_count: i64,
        runtime_duration_ms: i64,
        total_duration_ms: i64,
    ) -> CrawlerResult<()>;
}

/// 调度计划仓储
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: &Schedule) -> CrawlerResult<()>;
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Schedule>>;
    async fn get_enabled(&self) -> CrawlerResult<Vec<Schedule>>;
    async fn update(&self, schedule: &Schedule) -> CrawlerResult<()>;
    /// 持久化启用状态与cron条目句柄
    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        entry_id: i64,
        by: &str,
    ) -> CrawlerResult<()>;
}

/// 节点仓储
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// 按 `key` 幂等插入或更新，返回最终节点记录
    async fn upsert(&self, node: &Node) -> CrawlerResult<Node>;
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Node>>;
    async fn get_by_key(&self, key: &str) -> CrawlerResult<Option<Node>>;
    async fn get_active_nodes(&self) -> CrawlerResult<Vec<Node>>;
    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> CrawlerResult<()>;
    async fn set_current_runners(&self, id: &str, n: i32) -> CrawlerResult<()>;
}

/// 全局环境变量仓储
#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn get_all(&self) -> CrawlerResult<Vec<EnvironmentVar>>;
}

/// 任务日志存储驱动
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// 按任务ID追加日志行
    async fn write_lines(&self, task_id: &str, lines: &[String]) -> CrawlerResult<()>;
    async fn read_lines(&self, task_id: &str) -> CrawlerResult<Vec<String>>;
}

/// 抓取记录落库目标
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// 将一批记录（JSON对象）写入指定集合，返回实际写入条数
    async fn insert_records(
        &self,
        col_name: &str,
        records: &[serde_json::Value],
    ) -> CrawlerResult<u64>;
}

/// 任务结束通知（通知分发本身由外部承担）
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn task_finished(&self, task: &Task) -> CrawlerResult<()>;
}

/// 依赖安装器插件（外部协作者，按需注入）
///
/// 任务在文件同步之后、进程拉起之前调用；安装失败只告警不中断执行。
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, spider: &Spider, cwd: &std::path::Path) -> CrawlerResult<()>;
}

/// 主节点本地任务取消入口
///
/// 取消控制器对运行在主节点上的任务直接调用本地处理服务，
/// 而不经过订阅流。由工作端处理服务实现，组合根注入。
#[async_trait]
pub trait LocalTaskCanceller: Send + Sync {
    async fn cancel(&self, task_id: &str, force: bool) -> CrawlerResult<()>;
}

/// 仓储集合
///
/// 组合根构造一次后在各服务间共享（显式依赖注入，不使用全局单例）。
#[derive(Clone)]
pub struct Store {
    pub tasks: Arc<dyn TaskRepository>,
    pub task_stats: Arc<dyn TaskStatRepository>,
    pub spiders: Arc<dyn SpiderRepository>,
    pub spider_stats: Arc<dyn SpiderStatRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub environments: Arc<dyn EnvironmentRepository>,
}
