//! # 工作节点
//!
//! 维护到主节点的长连接（熔断+退避重连），周期领取任务，在受控的
//! 任务池里为每个任务启动一个Runner: 同步文件、拉起子进程、把
//! stdout/stderr复用为记录与日志上行、接收下行取消信号、清理僵尸进程。

pub mod circuit_breaker;
pub mod client;
pub mod connection;
pub mod handler;
pub mod ipc;
pub mod pool;
pub mod runner;
pub mod service;
pub mod stream_manager;
pub mod sync;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use connection::{ChannelState, ConnectionSupervisor};
pub use handler::TaskHandlerService;
pub use pool::WorkerPool;
pub use runner::{RunnerConfig, TaskRunner};
pub use service::WorkerService;
pub use stream_manager::StreamManager;
pub use sync::FileSyncClient;
