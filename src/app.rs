//! # 应用组合根
//!
//! 所有组件在这里实例化并显式注入依赖（不使用全局单例）。主节点进程
//! 同时运行控制面（RPC/调度/统计/同步HTTP）与一个内嵌工作节点，
//! 这样指派到主节点的任务可以本地执行，主节点本地取消路径也是真实的。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::info;

use crawler_config::AppConfig;
use crawler_domain::{LocalTaskCanceller, Store};
use crawler_infrastructure::{connect, migrate, sqlite_store, FileLogStorage, NoopNotifier, SqliteRecordSink};
use crawler_master::sync_server::{self, SyncState};
use crawler_master::{
    RecoveryService, RpcServer, ScheduleService, SubscriptionRegistry, TaskDispatchService,
    TaskStatsService,
};
use crawler_worker::{ConnectionSupervisor, TaskHandlerService, WorkerService};

use crate::shutdown::ShutdownManager;

/// 主节点控制面句柄
pub struct MasterHandle {
    pub store: Store,
    pub dispatcher: Arc<TaskDispatchService>,
    pub schedule_service: Arc<ScheduleService>,
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub log_dir: std::path::PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl MasterHandle {
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// 启动主节点控制面（不含内嵌工作节点）
pub async fn start_control_plane(config: &AppConfig) -> anyhow::Result<MasterHandle> {
    let pool = connect(&config.database_url).await.context("数据库连接失败")?;
    migrate(&pool).await.context("数据库迁移失败")?;
    let store = sqlite_store(pool.clone());

    // 重启恢复: 上一轮生命周期的非终态任务标记为abnormal
    let recovery = Arc::new(
        RecoveryService::new(store.clone()).with_gc(
            std::time::Duration::from_secs(config.scheduler.gc_interval_secs),
            config.scheduler.task_retention_days,
        ),
    );
    recovery.mark_abnormal_tasks().await?;

    let (shutdown_tx, _) = broadcast::channel(16);

    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let stats = Arc::new(TaskStatsService::new(
        store.clone(),
        Arc::new(FileLogStorage::new(config.log_dir.clone())),
        Arc::new(SqliteRecordSink::new(pool)),
    ));
    let dispatcher = Arc::new(TaskDispatchService::new(store.clone(), subscriptions.clone()));

    let schedule_service = Arc::new(
        ScheduleService::new(store.clone(), dispatcher.clone()).with_update_interval(
            std::time::Duration::from_secs(config.scheduler.update_interval_secs),
        ),
    );
    schedule_service.init().await?;
    schedule_service.start(&shutdown_tx);

    // 后台循环: 订阅表清扫、目标缓存清理、任务GC
    {
        let subscriptions = subscriptions.clone();
        let interval =
            std::time::Duration::from_secs(config.scheduler.stream_sweep_interval_secs);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            subscriptions.run_sweeper(interval, shutdown_rx).await;
        });
    }
    {
        let stats = stats.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            stats.run_cleaner(shutdown_rx).await;
        });
    }
    {
        let recovery = recovery.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            recovery.run_gc(shutdown_rx).await;
        });
    }

    // RPC服务
    let rpc_server = Arc::new(
        RpcServer::new(
            config.auth_key.clone(),
            store.clone(),
            stats,
            subscriptions,
        )
        .with_stream_max_age(std::time::Duration::from_secs(
            config.scheduler.stream_max_age_secs,
        )),
    );
    let rpc_listener =
        RpcServer::bind(&format!("{}:{}", config.master.host, config.master.rpc_port)).await?;
    let rpc_addr = rpc_listener.local_addr()?;
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            rpc_server.serve(rpc_listener, shutdown_rx).await;
        });
    }

    // 文件同步HTTP服务
    let http_listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.master.host, config.master.http_port
    ))
    .await
    .context("文件同步服务绑定失败")?;
    let http_addr = http_listener.local_addr()?;
    {
        let state = Arc::new(SyncState {
            workspace: config.workspace.clone().into(),
            auth_key: config.auth_key.clone(),
        });
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = sync_server::serve(state, http_listener, shutdown_rx).await;
        });
    }

    info!("主节点控制面已启动: rpc={} http={}", rpc_addr, http_addr);
    Ok(MasterHandle {
        store,
        dispatcher,
        schedule_service,
        rpc_addr,
        http_addr,
        log_dir: config.log_dir.clone().into(),
        shutdown_tx,
    })
}

/// 工作节点句柄
pub struct WorkerHandle {
    service: Arc<WorkerService>,
    pub handler: Arc<TaskHandlerService>,
}

impl WorkerHandle {
    pub async fn stop(&self) {
        self.service.stop().await;
    }
}

/// 启动工作节点（连接到配置中的主节点地址）
pub async fn start_worker(config: AppConfig) -> anyhow::Result<WorkerHandle> {
    let pool = connect(&config.database_url).await.context("数据库连接失败")?;
    migrate(&pool).await.context("数据库迁移失败")?;
    let store = sqlite_store(pool);

    let supervisor = ConnectionSupervisor::new(
        config.master.rpc_address(),
        config.node.key.clone(),
        config.auth_key.clone(),
        config.connection.clone(),
    );
    let handler = TaskHandlerService::new(
        &config,
        store,
        supervisor.clone(),
        Arc::new(NoopNotifier),
    );
    let service = WorkerService::new(config, supervisor, handler.clone());
    service.start().await?;

    Ok(WorkerHandle { service, handler })
}

/// 主节点进程: 控制面 + 内嵌工作节点
pub async fn start_master(config: AppConfig) -> anyhow::Result<(MasterHandle, WorkerHandle)> {
    let mut config = config;
    config.node.is_master = true;

    let master = start_control_plane(&config).await?;

    // 内嵌工作节点连接回环地址（端口0时以实际绑定端口为准）
    let mut worker_config = config.clone();
    worker_config.master.rpc_port = master.rpc_addr.port();
    worker_config.master.http_port = master.http_addr.port();
    let worker = start_worker(worker_config).await?;

    // 主节点本地取消直通内嵌工作服务
    let canceller: Arc<dyn LocalTaskCanceller> = worker.handler.clone();
    master.dispatcher.set_local_canceller(canceller).await;

    Ok((master, worker))
}

/// master子命令入口
pub async fn run_master(config: AppConfig) -> anyhow::Result<()> {
    let (master, worker) = start_master(config).await?;

    ShutdownManager::wait_for_signal().await;
    info!("开始优雅关闭");
    worker.stop().await;
    master.stop().await;
    Ok(())
}

/// worker子命令入口
pub async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let worker = start_worker(config).await?;

    ShutdownManager::wait_for_signal().await;
    info!("开始优雅关闭");
    worker.stop().await;
    Ok(())
}
