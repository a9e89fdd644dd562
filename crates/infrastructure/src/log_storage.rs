//! # 文件日志驱动
//!
//! 按任务ID落盘日志行: `{log_dir}/{task_id}/log.txt`。

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crawler_domain::LogStorage;
use crawler_errors::{CrawlerError, CrawlerResult};

pub struct FileLogStorage {
    base_dir: PathBuf,
}

impl FileLogStorage {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn log_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id).join("log.txt")
    }
}

#[async_trait]
impl LogStorage for FileLogStorage {
    async fn write_lines(&self, task_id: &str, lines: &[String]) -> CrawlerResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let path = self.log_path(task_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CrawlerError::Internal(format!("创建日志目录失败: {e}")))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CrawlerError::Internal(format!("打开日志文件失败: {e}")))?;

        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| CrawlerError::Internal(format!("写入日志失败: {e}")))?;
        Ok(())
    }

    async fn read_lines(&self, task_id: &str) -> CrawlerResult<Vec<String>> {
        let path = self.log_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CrawlerError::Internal(format!("读取日志失败: {e}")))?;
        Ok(content.lines().map(|s| s.to_string()).collect())
    }
}
