//! # 主节点控制面
//!
//! 调度计划（cron驱动的任务入列）、任务派发与取消控制、RPC服务、
//! 任务/爬虫统计聚合、启动恢复与过期任务清理、文件同步HTTP服务。

pub mod cron_registry;
pub mod dispatcher;
pub mod recovery;
pub mod registry;
pub mod rpc_server;
pub mod scheduler;
pub mod stats;
pub mod sync_server;

pub use cron_registry::CronRegistry;
pub use dispatcher::TaskDispatchService;
pub use recovery::RecoveryService;
pub use registry::SubscriptionRegistry;
pub use rpc_server::RpcServer;
pub use scheduler::ScheduleService;
pub use stats::TaskStatsService;
