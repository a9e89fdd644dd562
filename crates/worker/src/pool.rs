//! # 任务工作池
//!
//! 有界队列 + 按需创建的弹性工作协程。不预创建: 有任务排队且未达上限
//! 时才拉起新工作协程，空闲5分钟自动退出。队列饱和时提交立即失败，
//! 由领取循环下一轮重试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, warn};

use crawler_errors::{CrawlerError, CrawlerResult};

/// 工作协程空闲退出时间
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// 任务执行入口（由任务处理服务实现）
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute_task(&self, task_id: &str) -> CrawlerResult<()>;
}

pub struct WorkerPool {
    executor: Arc<dyn TaskExecutor>,
    queue: Mutex<VecDeque<String>>,
    queue_cap: usize,
    notify: Notify,
    max_workers: i32,
    active_workers: AtomicUsize,
    worker_seq: AtomicUsize,
    shutdown_tx: broadcast::Sender<()>,
    idle_timeout: Duration,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn TaskExecutor>, max_workers: i32, queue_cap: usize) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        if max_workers == -1 {
            debug!("任务池启动: 不限制工作协程，队列容量 {}", queue_cap);
        } else {
            debug!(
                "任务池启动: 最多 {} 个工作协程，队列容量 {}",
                max_workers, queue_cap
            );
        }
        Arc::new(Self {
            executor,
            queue: Mutex::new(VecDeque::new()),
            queue_cap,
            notify: Notify::new(),
            max_workers,
            active_workers: AtomicUsize::new(0),
            worker_seq: AtomicUsize::new(0),
            shutdown_tx,
            idle_timeout: WORKER_IDLE_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub fn with_idle_timeout(self: Arc<Self>, idle: Duration) -> Arc<Self> {
        let mut pool = Arc::try_unwrap(self).ok().expect("测试里池尚未共享");
        pool.idle_timeout = idle;
        Arc::new(pool)
    }

    /// 提交一个任务，队列饱和时返回QueueFull
    pub fn submit(self: &Arc<Self>, task_id: String) -> CrawlerResult<()> {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.queue_cap {
                warn!(
                    "任务队列已满 ({}/{})，拒绝任务 {}",
                    queue.len(),
                    self.queue_cap,
                    task_id
                );
                return Err(CrawlerError::QueueFull {
                    len: queue.len(),
                    cap: self.queue_cap,
                });
            }
            queue.push_back(task_id);
        }
        self.notify.notify_one();
        self.maybe_spawn_worker();
        Ok(())
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// 有排队任务且未达上限时拉起新工作协程
    fn maybe_spawn_worker(self: &Arc<Self>) {
        let has_queued = !self.queue.lock().unwrap().is_empty();
        if !has_queued {
            return;
        }
        let active = self.active_workers.load(Ordering::SeqCst);
        let under_limit = self.max_workers == -1 || active < self.max_workers as usize;
        if !under_limit {
            return;
        }

        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let worker_id = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = self.clone();
        tokio::spawn(async move {
            pool.worker_loop(worker_id).await;
        });
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("工作协程 {} 启动", worker_id);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let task_id = self.queue.lock().unwrap().pop_front();
            match task_id {
                Some(task_id) => {
                    debug!("工作协程 {} 处理任务 {}", worker_id, task_id);
                    if let Err(e) = self.executor.execute_task(&task_id).await {
                        error!("工作协程 {} 执行任务 {} 失败: {}", worker_id, task_id, e);
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = tokio::time::sleep(self.idle_timeout) => {
                            debug!("工作协程 {} 空闲退出", worker_id);
                            break;
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("工作协程 {} 收到停止信号", worker_id);
                            break;
                        }
                    }
                }
            }
        }
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        executed: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute_task(&self, _task_id: &str) -> CrawlerResult<()> {
            tokio::time::sleep(self.delay).await;
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_executes_submitted_tasks() {
        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
            delay: Duration::from_millis(5),
        });
        let pool = WorkerPool::new(executor.clone(), 4, 50);

        for i in 0..10 {
            pool.submit(format!("task-{i}")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executor.executed.load(Ordering::SeqCst), 10);
        pool.stop();
    }

    #[tokio::test]
    async fn test_queue_full_rejected() {
        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
            // 执行足够慢，队列得不到消化
            delay: Duration::from_secs(60),
        });
        let pool = WorkerPool::new(executor, 1, 2);

        // 第一个任务很快被工作协程取走，之后两个占满队列
        pool.submit("t1".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit("t2".to_string()).unwrap();
        pool.submit("t3".to_string()).unwrap();

        let err = pool.submit("t4".to_string()).unwrap_err();
        assert!(matches!(err, CrawlerError::QueueFull { .. }));
        pool.stop();
    }

    #[tokio::test]
    async fn test_worker_count_respects_limit() {
        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let pool = WorkerPool::new(executor, 2, 50);

        for i in 0..6 {
            pool.submit(format!("task-{i}")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.active_workers() <= 2);
        pool.stop();
    }

    #[tokio::test]
    async fn test_idle_worker_exits() {
        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let pool = WorkerPool::new(executor, 2, 50).with_idle_timeout(Duration::from_millis(50));

        pool.submit("t1".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active_workers(), 1);

        // 空闲超时后退出
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.active_workers(), 0);
        pool.stop();
    }
}
