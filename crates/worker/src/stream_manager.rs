//! # 下行流管理器
//!
//! 工作节点侧的任务订阅流集合: 每个执行中的任务一条下行流，一个读取
//! 协程把收到的帧转发到共享的有界消息队列，由单个处理协程消费。
//! 流数量有上限，长期不活跃的流被周期清扫。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crawler_domain::LocalTaskCanceller;
use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{SubscribeCode, SubscribeFrame};

use crate::client::TaskClient;
use crate::connection::ConnectionSupervisor;

/// 共享消息队列容量
const MESSAGE_QUEUE_CAP: usize = 100;
/// 清扫间隔
const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
/// 不活跃流的淘汰阈值
const INACTIVE_THRESHOLD: Duration = Duration::from_secs(600);

struct StreamHandle {
    cancel_tx: watch::Sender<bool>,
    last_active: Arc<Mutex<Instant>>,
}

struct StreamMessage {
    task_id: String,
    frame: SubscribeFrame,
}

pub struct StreamManager {
    supervisor: Arc<ConnectionSupervisor>,
    max_streams: usize,
    recv_timeout: Duration,
    streams: Mutex<HashMap<String, StreamHandle>>,
    queue_tx: mpsc::Sender<StreamMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<StreamMessage>>>,
    canceller: RwLock<Option<Arc<dyn LocalTaskCanceller>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamManager {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        max_streams: usize,
        recv_timeout: Duration,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(MESSAGE_QUEUE_CAP);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            supervisor,
            max_streams,
            recv_timeout,
            streams: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            canceller: RwLock::new(None),
            shutdown_tx,
        })
    }

    /// 启动消息处理协程与清扫协程
    pub async fn start(self: &Arc<Self>, canceller: Arc<dyn LocalTaskCanceller>) {
        *self.canceller.write().await = Some(canceller);

        // 消息处理协程
        {
            let manager = self.clone();
            let mut rx = manager
                .queue_rx
                .lock()
                .unwrap()
                .take()
                .expect("消息队列接收端只能被启动一次");
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = rx.recv() => {
                            let Some(msg) = msg else { return };
                            manager.process_message(msg).await;
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("下行流消息处理协程退出");
                            return;
                        }
                    }
                }
            });
        }

        // 不活跃流清扫协程
        {
            let manager = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.sweep_inactive(),
                        _ = shutdown_rx.recv() => {
                            debug!("下行流清扫协程退出");
                            return;
                        }
                    }
                }
            });
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let mut streams = self.streams.lock().unwrap();
        for (_, handle) in streams.drain() {
            handle.cancel_tx.send_replace(true);
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// 为任务打开一条下行流并启动读取协程
    pub async fn add_task_stream(self: &Arc<Self>, task_id: &str) -> CrawlerResult<()> {
        {
            let streams = self.streams.lock().unwrap();
            if streams.contains_key(task_id) {
                debug!("任务 {} 的下行流已存在，跳过", task_id);
                return Ok(());
            }
            if streams.len() >= self.max_streams {
                warn!(
                    "下行流数量达到上限 ({}/{})，拒绝任务 {}",
                    streams.len(),
                    self.max_streams,
                    task_id
                );
                return Err(CrawlerError::unavailable(format!(
                    "下行流数量达到上限 {}",
                    self.max_streams
                )));
            }
        }

        let client = TaskClient::new(self.supervisor.clone());
        let stream = client.subscribe(task_id).await?;

        let (cancel_tx, _) = watch::channel(false);
        let last_active = Arc::new(Mutex::new(Instant::now()));
        {
            let mut streams = self.streams.lock().unwrap();
            streams.insert(
                task_id.to_string(),
                StreamHandle {
                    cancel_tx: cancel_tx.clone(),
                    last_active: last_active.clone(),
                },
            );
        }
        info!(
            "任务 {} 的下行流已建立，当前 {}/{}",
            task_id,
            self.stream_count(),
            self.max_streams
        );

        let manager = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            manager
                .stream_reader(task_id.clone(), stream, cancel_tx, last_active)
                .await;
            manager.remove_task_stream(&task_id);
        });
        Ok(())
    }

    pub fn remove_task_stream(&self, task_id: &str) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(handle) = streams.remove(task_id) {
            handle.cancel_tx.send_replace(true);
            debug!(
                "任务 {} 的下行流已移除，剩余 {}",
                task_id,
                streams.len()
            );
        }
    }

    async fn stream_reader(
        &self,
        task_id: String,
        mut stream: crate::client::DownlinkStream,
        cancel_tx: watch::Sender<bool>,
        last_active: Arc<Mutex<Instant>>,
    ) {
        let mut cancel_rx = cancel_tx.subscribe();
        loop {
            tokio::select! {
                result = tokio::time::timeout(self.recv_timeout, stream.recv()) => {
                    match result {
                        // 接收超时只是无消息，继续等
                        Err(_) => continue,
                        Ok(Ok(Some(frame))) => {
                            *last_active.lock().unwrap() = Instant::now();
                            let msg = StreamMessage { task_id: task_id.clone(), frame };
                            if self.queue_tx.try_send(msg).is_err() {
                                warn!("下行流消息队列已满，丢弃任务 {} 的消息", task_id);
                            }
                        }
                        Ok(Ok(None)) => {
                            debug!("任务 {} 的下行流被服务端关闭", task_id);
                            return;
                        }
                        Ok(Err(e)) => {
                            debug!("任务 {} 的下行流读取错误: {}", task_id, e);
                            return;
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        debug!("任务 {} 的下行流读取协程退出", task_id);
                        return;
                    }
                }
            }
        }
    }

    async fn process_message(&self, msg: StreamMessage) {
        match msg.frame.code {
            SubscribeCode::Cancel => {
                info!("任务 {} 收到取消信号 (force={})", msg.task_id, msg.frame.force);
                if msg.frame.task_id != msg.task_id {
                    error!(
                        "下行流消息的任务ID不匹配: {} vs {}",
                        msg.frame.task_id, msg.task_id
                    );
                    return;
                }
                let canceller = self.canceller.read().await.clone();
                match canceller {
                    Some(canceller) => {
                        if let Err(e) = canceller.cancel(&msg.task_id, msg.frame.force).await {
                            error!("任务 {} 执行取消失败: {}", msg.task_id, e);
                        }
                    }
                    None => {
                        error!("未注入取消处理器，无法处理任务 {} 的取消信号", msg.task_id);
                    }
                }
            }
            SubscribeCode::Unknown => {
                debug!("任务 {} 收到未知下行消息码，忽略", msg.task_id);
            }
        }
    }

    /// 淘汰不活跃流
    fn sweep_inactive(&self) {
        let mut expired = Vec::new();
        {
            let streams = self.streams.lock().unwrap();
            for (task_id, handle) in streams.iter() {
                if handle.last_active.lock().unwrap().elapsed() > INACTIVE_THRESHOLD {
                    expired.push(task_id.clone());
                }
            }
        }
        for task_id in expired {
            debug!("淘汰不活跃的下行流: {}", task_id);
            self.remove_task_stream(&task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crawler_config::ConnectionSettings;

    struct RecordingCanceller {
        cancelled: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl LocalTaskCanceller for RecordingCanceller {
        async fn cancel(&self, task_id: &str, force: bool) -> CrawlerResult<()> {
            self.cancelled
                .lock()
                .unwrap()
                .push((task_id.to_string(), force));
            Ok(())
        }
    }

    fn make_manager() -> Arc<StreamManager> {
        let supervisor = ConnectionSupervisor::new(
            "127.0.0.1:1".to_string(),
            "w1".to_string(),
            "secret".to_string(),
            ConnectionSettings {
                client_timeout_secs: 1,
                connect_timeout_secs: 1,
                ..Default::default()
            },
        );
        StreamManager::new(supervisor, 2, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_add_stream_fails_when_master_unreachable() {
        let manager = make_manager();
        let err = manager.add_task_stream("t1").await.unwrap_err();
        assert!(matches!(
            err,
            CrawlerError::Unavailable(_) | CrawlerError::Network(_) | CrawlerError::Timeout(_)
        ));
        assert_eq!(manager.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_message_dispatched_to_canceller() {
        let manager = make_manager();
        let canceller = Arc::new(RecordingCanceller {
            cancelled: Mutex::new(Vec::new()),
        });
        manager.start(canceller.clone()).await;

        // 直接投递一条取消消息（绕过网络）
        manager
            .queue_tx
            .try_send(StreamMessage {
                task_id: "t1".to_string(),
                frame: SubscribeFrame {
                    code: SubscribeCode::Cancel,
                    task_id: "t1".to_string(),
                    force: true,
                },
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled = canceller.cancelled.lock().unwrap();
        assert_eq!(cancelled.as_slice(), &[("t1".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_sweep_evicts_inactive_streams() {
        let manager = make_manager();
        // 手工塞入一个"很久没有活动"的流句柄
        let Some(stale) = Instant::now().checked_sub(INACTIVE_THRESHOLD + Duration::from_secs(60))
        else {
            // 系统启动时间不足以构造过期时刻时跳过
            return;
        };
        let (cancel_tx, _) = watch::channel(false);
        manager.streams.lock().unwrap().insert(
            "t-stale".to_string(),
            StreamHandle {
                cancel_tx,
                last_active: Arc::new(Mutex::new(stale)),
            },
        );
        assert_eq!(manager.stream_count(), 1);

        manager.sweep_inactive();
        assert_eq!(manager.stream_count(), 0);
    }
}
