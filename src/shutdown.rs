//! # 优雅关闭管理

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 所有后台循环订阅同一个关闭信号；触发后发送端被清空，
/// 此后的订阅者会立即收到信号。
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<RwLock<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭（幂等）
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭信号已触发过");
            return;
        }
        *is_shutdown = true;

        let count = self.shutdown_tx.receiver_count();
        debug!("发送关闭信号给 {} 个订阅者", count);
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }

    /// 等待进程退出信号（Ctrl-C / SIGTERM）
    pub async fn wait_for_signal() {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("注册SIGTERM处理失败");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("收到Ctrl-C信号"),
                _ = sigterm.recv() => info!("收到SIGTERM信号"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("收到Ctrl-C信号");
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: self.shutdown_tx.clone(),
            is_shutdown: Arc::clone(&self.is_shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_signals_subscribers() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown().await);

        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.subscribe();
        manager.shutdown().await;

        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_double_shutdown_is_noop() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown().await);
    }
}
