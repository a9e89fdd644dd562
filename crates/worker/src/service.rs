//! # 工作节点服务
//!
//! 启动流程: 等待连接就绪 → 注册节点（无限指数退避，未注册的节点无法
//! 工作）→ 启动心跳循环、节点管理流保活与任务处理服务。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crawler_config::AppConfig;
use crawler_errors::CrawlerResult;
use crawler_protocol::{NodeSubscribeCode, RegisterNodeRequest};

use crate::connection::ConnectionSupervisor;
use crate::handler::TaskHandlerService;

/// 注册重试的退避上限
const REGISTER_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// 节点管理流连续失败的退避上限
const SUBSCRIBE_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// 节点管理流连续失败的容忍时长（超过后记错误日志并继续重试）
const SUBSCRIBE_MAX_ELAPSED: Duration = Duration::from_secs(600);

pub struct WorkerService {
    config: AppConfig,
    supervisor: Arc<ConnectionSupervisor>,
    handler: Arc<TaskHandlerService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerService {
    pub fn new(
        config: AppConfig,
        supervisor: Arc<ConnectionSupervisor>,
        handler: Arc<TaskHandlerService>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            supervisor,
            handler,
            shutdown_tx,
        })
    }

    pub fn handler(&self) -> Arc<TaskHandlerService> {
        self.handler.clone()
    }

    /// 启动工作节点
    pub async fn start(self: &Arc<Self>) -> CrawlerResult<()> {
        self.supervisor.start().await;
        self.supervisor.wait_for_ready().await;

        self.register_with_retry().await;

        // 心跳循环
        {
            let svc = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = Duration::from_secs(self.config.worker.heartbeat_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => svc.send_heartbeat().await,
                        _ = shutdown_rx.recv() => {
                            debug!("心跳循环退出");
                            return;
                        }
                    }
                }
            });
        }

        // 节点管理流保活
        {
            let svc = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = svc.subscribe_loop() => {}
                    _ = shutdown_rx.recv() => {
                        debug!("节点管理流保活退出");
                    }
                }
            });
        }

        self.handler.start().await;
        info!("工作节点服务已启动: {}", self.config.node.key);
        Ok(())
    }

    pub async fn stop(&self) {
        info!("停止工作节点服务: {}", self.config.node.key);
        let _ = self.shutdown_tx.send(());
        self.handler.stop().await;
        self.supervisor.stop().await;
        info!("工作节点服务已停止: {}", self.config.node.key);
    }

    /// 注册到主节点，失败时无限指数退避重试
    async fn register_with_retry(&self) {
        let req = RegisterNodeRequest {
            node_key: self.config.node.key.clone(),
            node_name: self.config.node.name.clone(),
            max_runners: self.config.node.max_runners,
            is_master: self.config.node.is_master,
        };

        let mut attempt: u32 = 0;
        loop {
            if self.supervisor.is_stopped() {
                return;
            }
            match self.supervisor.node_client().await {
                Ok(client) => match client.register(&req).await {
                    Ok(node_id) => {
                        info!(
                            "节点注册成功: {} id={}",
                            self.config.node.key, node_id
                        );
                        return;
                    }
                    Err(e) => {
                        error!("节点注册失败: {} - {}", self.config.node.key, e);
                    }
                },
                Err(e) => {
                    error!("获取节点stub失败: {}", e);
                }
            }

            attempt += 1;
            let backoff = std::cmp::min(
                Duration::from_secs(1 << std::cmp::min(attempt - 1, 6)),
                REGISTER_BACKOFF_CAP,
            );
            info!("{}秒后重试注册", backoff.as_secs());
            tokio::time::sleep(backoff).await;
        }
    }

    async fn send_heartbeat(&self) {
        let client = match self.supervisor.node_client().await {
            Ok(client) => client,
            // 连接暂时不可用: 静默跳过本次心跳
            Err(_) => return,
        };
        if let Err(e) = client.send_heartbeat(&self.config.node.key).await {
            debug!("心跳发送失败: {}", e);
        }
    }

    /// 节点管理流: 长期保持，断开后指数退避重连
    async fn subscribe_loop(&self) {
        let mut attempt: u32 = 0;
        let mut failing_since: Option<std::time::Instant> = None;

        loop {
            if self.supervisor.is_stopped() {
                return;
            }

            let stream = match self.supervisor.node_client().await {
                Ok(client) => client.subscribe(&self.config.node.key).await,
                Err(e) => Err(e),
            };

            match stream {
                Ok(mut stream) => {
                    debug!("节点管理流已建立");
                    attempt = 0;
                    failing_since = None;
                    loop {
                        match stream.recv().await {
                            Ok(Some(frame)) => match frame.code {
                                NodeSubscribeCode::ConnectPing => {}
                                NodeSubscribeCode::Unknown => {
                                    debug!("节点管理流收到未知消息码");
                                }
                            },
                            Ok(None) => {
                                warn!("节点管理流被服务端关闭");
                                break;
                            }
                            Err(e) => {
                                warn!("节点管理流读取失败: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    let since = *failing_since.get_or_insert_with(std::time::Instant::now);
                    if since.elapsed() > SUBSCRIBE_MAX_ELAPSED {
                        error!(
                            "节点管理流连续失败超过 {} 秒: {}",
                            SUBSCRIBE_MAX_ELAPSED.as_secs(),
                            e
                        );
                        failing_since = Some(std::time::Instant::now());
                    } else {
                        debug!("节点管理流建立失败: {}", e);
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let backoff = std::cmp::min(
                Duration::from_secs(1 << std::cmp::min(attempt - 1, 6)),
                SUBSCRIBE_BACKOFF_CAP,
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
