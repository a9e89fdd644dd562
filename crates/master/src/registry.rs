//! # 任务订阅注册表
//!
//! `task_id → 下行流发送端` 的映射。订阅RPC处理器持有条目生命周期:
//! 打开时登记，流结束时摘除；周期清扫兜底移除已关闭的发送端。
//! 不变量: 任一时刻每个任务至多一个条目。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crawler_protocol::SubscribeFrame;

struct SubscriptionEntry {
    sender: mpsc::Sender<SubscribeFrame>,
    /// 流令牌: 新流顶替旧流后，旧流退出时不得误删新条目
    token: u64,
}

pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, SubscriptionEntry>>,
    next_token: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// 登记一个任务的下行流，返回流令牌
    pub fn add(&self, task_id: &str, sender: mpsc::Sender<SubscribeFrame>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if inner.insert(task_id.to_string(), SubscriptionEntry { sender, token }).is_some() {
            debug!("任务下行流被新流顶替: {}", task_id);
        }
        token
    }

    /// 摘除条目（仅当令牌匹配，防止旧流误删新流）
    pub fn remove(&self, task_id: &str, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.get(task_id).map(|e| e.token) == Some(token) {
            inner.remove(task_id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<mpsc::Sender<SubscribeFrame>> {
        let inner = self.inner.lock().unwrap();
        inner.get(task_id).map(|e| e.sender.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 移除发送端已关闭的条目，返回清除数量
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, e| !e.sender.is_closed());
        before - inner.len()
    }

    /// 周期清扫循环
    pub async fn run_sweeper(
        &self,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        info!("清除了 {} 条失效的任务下行流", removed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("下行流清扫循环退出");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_most_one_entry_per_task() {
        let registry = SubscriptionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let t1 = registry.add("task-a", tx1);
        let t2 = registry.add("task-a", tx2);
        assert_eq!(registry.len(), 1);

        // 旧流退出时不得误删新条目
        registry.remove("task-a", t1);
        assert_eq!(registry.len(), 1);

        registry.remove("task-a", t2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_removes_closed() {
        let registry = SubscriptionRegistry::new();
        let (tx1, rx1) = mpsc::channel::<SubscribeFrame>(4);
        let (tx2, _rx2) = mpsc::channel::<SubscribeFrame>(4);
        registry.add("task-a", tx1);
        registry.add("task-b", tx2);

        drop(rx1);
        assert_eq!(registry.sweep(), 1);
        assert!(registry.get("task-a").is_none());
        assert!(registry.get("task-b").is_some());
    }
}
