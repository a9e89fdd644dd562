//! 通知分发由外部系统承担，这里提供空实现占位。

use async_trait::async_trait;
use tracing::debug;

use crawler_domain::{Notifier, Task};
use crawler_errors::CrawlerResult;

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn task_finished(&self, task: &Task) -> CrawlerResult<()> {
        debug!("任务结束通知: {} status={}", task.id, task.status);
        Ok(())
    }
}
