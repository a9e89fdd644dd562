//! # 连接管理器
//!
//! 维护到主节点RPC地址的长期通道。状态机:
//! `Idle → Connecting → {Ready | TransientFailure} → {Idle | Ready | Shutdown}`。
//!
//! 重连请求通过容量为1的通道发布（天然合并重复请求），熔断器打开期间
//! 的请求被直接丢弃。所有stub获取方法阻塞等待注册完成或超时。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crawler_config::ConnectionSettings;
use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{read_frame, write_frame, Hello, Reply, RpcVerb};

use crate::circuit_breaker::CircuitBreaker;
use crate::client::{NodeClient, TaskClient};

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

pub struct ConnectionSupervisor {
    address: String,
    node_key: String,
    auth_key: String,
    settings: ConnectionSettings,

    state_tx: watch::Sender<ChannelState>,
    registered_tx: watch::Sender<bool>,
    reconnect_tx: mpsc::Sender<&'static str>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<&'static str>>>,
    breaker: Mutex<CircuitBreaker>,
    idle_since: Mutex<Option<Instant>>,

    stopped: AtomicBool,
    stop_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        address: String,
        node_key: String,
        auth_key: String,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        let (registered_tx, _) = watch::channel(false);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (stop_tx, _) = broadcast::channel(1);
        let breaker = CircuitBreaker::new(
            settings.cb_max_failures,
            Duration::from_secs(settings.cb_reset_secs),
            Duration::from_secs(settings.cb_half_open_retry_secs),
        );

        Arc::new(Self {
            address,
            node_key,
            auth_key,
            settings,
            state_tx,
            registered_tx,
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            breaker: Mutex::new(breaker),
            idle_since: Mutex::new(Some(Instant::now())),
            stopped: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    /// 启动: 首次连接 + 监测循环
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.do_connect().await {
            error!("初次连接失败，交由重连处理: {}", e);
            self.request_reconnect("initial connect failed");
        }

        let mut handles = Vec::new();

        // 重连处理循环
        {
            let sup = self.clone();
            let mut rx = sup
                .reconnect_rx
                .lock()
                .unwrap()
                .take()
                .expect("重连接收端只能被启动一次");
            let mut stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        req = rx.recv() => {
                            let Some(reason) = req else { return };
                            sup.execute_reconnection(reason).await;
                        }
                        _ = stop_rx.recv() => {
                            debug!("重连处理循环退出");
                            return;
                        }
                    }
                }
            }));
        }

        // 状态监测循环
        {
            let sup = self.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            let interval = Duration::from_secs(self.settings.state_monitor_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => sup.check_state().await,
                        _ = stop_rx.recv() => {
                            debug!("状态监测循环退出");
                            return;
                        }
                    }
                }
            }));
        }

        // 应用层健康探测循环
        {
            let sup = self.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            let interval = Duration::from_secs(self.settings.health_check_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // 启动后的第一个tick跳过（刚连接完没必要立即探测）
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if sup.is_registered() && sup.probe().await.is_err() {
                                warn!("健康探测失败，触发重连");
                                sup.request_reconnect("health check failure");
                            }
                        }
                        _ = stop_rx.recv() => {
                            debug!("健康探测循环退出");
                            return;
                        }
                    }
                }
            }));
        }

        self.tasks.lock().unwrap().extend(handles);
    }

    /// 停止（幂等）: 通知所有监测循环并在限时内等待退出
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_registered(false);
        self.state_tx.send_replace(ChannelState::Shutdown);
        let _ = self.stop_tx.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), join_all)
            .await
            .is_err()
        {
            warn!("部分监测循环未在限时内退出");
        }
        info!("连接管理器已停止: {}", self.address);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.client_timeout_secs)
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn is_registered(&self) -> bool {
        *self.registered_tx.borrow()
    }

    fn set_registered(&self, registered: bool) {
        self.registered_tx.send_replace(registered);
    }

    /// 等待注册完成（无限期，直到Stop）
    pub async fn wait_for_ready(&self) {
        let mut rx = self.registered_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = stop_rx.recv() => {
                    error!("连接管理器已停止，放弃等待就绪");
                    return;
                }
            }
        }
    }

    /// 限时等待注册完成
    pub async fn wait_registered(&self, timeout: Duration) -> CrawlerResult<()> {
        if self.is_stopped() {
            return Err(CrawlerError::unavailable("连接管理器已停止"));
        }
        if self.is_registered() {
            return Ok(());
        }
        let mut rx = self.registered_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CrawlerError::unavailable("等待连接注册超时"))?;
        if self.is_registered() {
            Ok(())
        } else {
            Err(CrawlerError::unavailable("连接未注册"))
        }
    }

    /// 获取节点服务stub（阻塞到注册完成或超时）
    pub async fn node_client(self: &Arc<Self>) -> CrawlerResult<NodeClient> {
        self.wait_registered(Duration::from_secs(self.settings.client_timeout_secs))
            .await?;
        Ok(NodeClient::new(self.clone()))
    }

    /// 获取任务服务stub（阻塞到注册完成或超时）
    pub async fn task_client(self: &Arc<Self>) -> CrawlerResult<TaskClient> {
        self.wait_registered(Duration::from_secs(self.settings.client_timeout_secs))
            .await?;
        Ok(TaskClient::new(self.clone()))
    }

    /// 发布重连请求（非阻塞，容量1的通道自动合并）
    pub fn request_reconnect(&self, reason: &'static str) {
        if self.is_stopped() {
            return;
        }
        if !self.breaker.lock().unwrap().can_attempt() {
            debug!("熔断器抑制重连请求: {}", reason);
            return;
        }
        match self.reconnect_tx.try_send(reason) {
            Ok(()) => info!("重连请求已发布: {}", reason),
            Err(_) => debug!("重连请求已在队列中"),
        }
    }

    async fn execute_reconnection(&self, reason: &'static str) {
        if self.is_stopped() {
            return;
        }
        {
            let mut breaker = self.breaker.lock().unwrap();
            if !breaker.can_attempt() {
                debug!("熔断器打开，跳过重连: {}", reason);
                return;
            }
            breaker.record_attempt();
        }

        info!("执行重连: {} ({})", self.address, reason);
        if let Err(e) = self.do_connect().await {
            let backoff = {
                let mut breaker = self.breaker.lock().unwrap();
                breaker.record_failure();
                if breaker.state() == crate::circuit_breaker::CircuitState::Open {
                    warn!("连续失败 {} 次，熔断器打开", breaker.failure_count());
                }
                breaker.backoff()
            };
            error!("重连失败: {}，{}秒后允许下次尝试", e, backoff.as_secs());
            tokio::time::sleep(backoff).await;
            // 失败后补发请求，保证后台持续重试
            self.request_reconnect("retry after failure");
        } else {
            info!("重连成功: {}", self.address);
        }
    }

    /// 建立连接: 用ping动词验证可达性与密钥
    async fn do_connect(&self) -> CrawlerResult<()> {
        self.set_registered(false);
        self.state_tx.send_replace(ChannelState::Connecting);

        match self.probe().await {
            Ok(()) => {
                self.state_tx.send_replace(ChannelState::Ready);
                self.set_registered(true);
                self.breaker.lock().unwrap().record_success();
                *self.idle_since.lock().unwrap() = None;
                info!("已连接到主节点: {}", self.address);
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_replace(ChannelState::TransientFailure);
                Err(e)
            }
        }
    }

    /// 应用层健康探测（ping动词）
    async fn probe(&self) -> CrawlerResult<()> {
        self.call(RpcVerb::Ping, serde_json::Value::Null)
            .await
            .map(|_| ())
    }

    /// 状态监测: 处理TransientFailure与长时间Idle
    async fn check_state(&self) {
        if self.is_stopped() {
            return;
        }
        match self.state() {
            ChannelState::TransientFailure => {
                self.set_registered(false);
                self.request_reconnect("transient failure");
            }
            ChannelState::Idle => {
                let grace = Duration::from_secs(self.settings.idle_grace_secs);
                let expired = self
                    .idle_since
                    .lock()
                    .unwrap()
                    .map(|at| at.elapsed() > grace)
                    .unwrap_or(false);
                if expired && self.probe().await.is_err() {
                    self.request_reconnect("prolonged idle with failed probe");
                }
            }
            _ => {}
        }
    }

    /// 打开一元调用连接并完成请求
    pub(crate) async fn call(
        &self,
        verb: RpcVerb,
        payload: serde_json::Value,
    ) -> CrawlerResult<serde_json::Value> {
        let mut stream = self.dial(verb, payload).await?;
        let reply: Reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| CrawlerError::network("连接在应答前被关闭"))?;
        reply.into_result()
    }

    /// 打开流式连接并等待服务端确认
    pub(crate) async fn open_stream(
        &self,
        verb: RpcVerb,
        payload: serde_json::Value,
    ) -> CrawlerResult<TcpStream> {
        let mut stream = self.dial(verb, payload).await?;
        let reply: Reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| CrawlerError::network("连接在应答前被关闭"))?;
        reply.into_result()?;
        Ok(stream)
    }

    async fn dial(&self, verb: RpcVerb, payload: serde_json::Value) -> CrawlerResult<TcpStream> {
        if self.is_stopped() {
            return Err(CrawlerError::unavailable("连接管理器已停止"));
        }
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CrawlerError::timeout(format!("连接主节点超时: {}", self.address)))?
            .map_err(|e| CrawlerError::network(format!("连接主节点失败: {e}")))?;

        write_frame(
            &mut stream,
            &Hello {
                verb,
                node_key: self.node_key.clone(),
                auth_token: self.auth_key.clone(),
                payload,
            },
        )
        .await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            state_monitor_interval_secs: 1,
            health_check_interval_secs: 1,
            idle_grace_secs: 1,
            cb_max_failures: 3,
            cb_reset_secs: 1,
            cb_half_open_retry_secs: 1,
            connect_timeout_secs: 1,
            client_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_stub_accessor_times_out_when_unreachable() {
        // 指向无人监听的端口
        let sup = ConnectionSupervisor::new(
            "127.0.0.1:1".to_string(),
            "w1".to_string(),
            "secret".to_string(),
            fast_settings(),
        );
        let err = sup.task_client().await.unwrap_err();
        assert!(matches!(err, CrawlerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_breaker_suppresses_reconnect_requests() {
        let sup = ConnectionSupervisor::new(
            "127.0.0.1:1".to_string(),
            "w1".to_string(),
            "secret".to_string(),
            fast_settings(),
        );
        // 注入连续失败直到熔断器打开
        {
            let mut breaker = sup.breaker.lock().unwrap();
            for _ in 0..3 {
                breaker.record_failure();
            }
        }
        sup.request_reconnect("test");
        // 熔断器打开期间请求被丢弃，通道保持为空
        let mut rx = sup.reconnect_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sup = ConnectionSupervisor::new(
            "127.0.0.1:1".to_string(),
            "w1".to_string(),
            "secret".to_string(),
            fast_settings(),
        );
        sup.stop().await;
        sup.stop().await;
        assert!(sup.is_stopped());
        assert_eq!(sup.state(), ChannelState::Shutdown);

        let err = sup.wait_registered(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CrawlerError::Unavailable(_)));
    }
}
