//! # 文件同步客户端
//!
//! 任务执行前把主节点工作区的爬虫文件增量同步到本地:
//! 拉取清单 → 按内容哈希比对 → 并行下载（上限10路）→ 删除上游已不存在
//! 的本地文件。批量字节走HTTP，不占用RPC控制通道。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crawler_common::fs::{join_under, scan_directory, FsFileInfoMap};
use crawler_errors::{CrawlerError, CrawlerResult};

/// 并行下载上限
const MAX_CONCURRENT_DOWNLOADS: usize = 10;

pub struct FileSyncClient {
    http: reqwest::Client,
    endpoint: String,
    auth_key: String,
}

impl FileSyncClient {
    pub fn new(endpoint: String, auth_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            auth_key,
        }
    }

    /// 同步一个爬虫的文件到本地目录
    ///
    /// `sync_id` 是爬虫ID（或Git爬虫的git_id），`sub_path` 是Git根目录。
    pub async fn sync_files(
        &self,
        sync_id: &str,
        sub_path: &str,
        dest: &Path,
    ) -> CrawlerResult<()> {
        info!("开始同步文件: {} -> {}", sync_id, dest.display());

        let master_files = self.fetch_file_list(sync_id, sub_path).await?;

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| CrawlerError::Internal(format!("创建工作目录失败: {e}")))?;

        let local_files = scan_directory(dest)?;

        // 删除上游已不存在的本地文件
        for (path, local) in &local_files {
            if !master_files.contains_key(path) && !local.is_dir {
                let full = dest.join(path);
                debug!("删除本地多余文件: {}", full.display());
                if let Err(e) = tokio::fs::remove_file(&full).await {
                    warn!("删除文件失败 {}: {}", full.display(), e);
                }
            }
        }

        // 下载新增或内容变化的文件（并行，上限10路）
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS));
        let mut downloads = JoinSet::new();
        let mut synced = 0usize;

        for (path, remote) in master_files {
            if remote.is_dir {
                let dir = join_under(dest, &path)?;
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| CrawlerError::Internal(format!("创建目录失败: {e}")))?;
                continue;
            }
            let unchanged = local_files
                .get(&path)
                .map(|local| local.hash == remote.hash)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            synced += 1;
            let target = join_under(dest, &path)?;
            let url = self.download_url(sync_id, &path);
            let http = self.http.clone();
            let auth_key = self.auth_key.clone();
            let semaphore = semaphore.clone();
            downloads.spawn(async move {
                let _permit = semaphore.acquire().await;
                download_file(&http, &url, &auth_key, &target).await
            });
        }

        let mut failures = Vec::new();
        while let Some(result) = downloads.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !failures.is_empty() {
            return Err(CrawlerError::network(format!(
                "{} 个文件下载失败: {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        info!("文件同步完成: {} 个文件更新", synced);
        Ok(())
    }

    async fn fetch_file_list(&self, sync_id: &str, sub_path: &str) -> CrawlerResult<FsFileInfoMap> {
        let url = format!("{}/sync/{}/scan", self.endpoint, sync_id);
        let response = self
            .http
            .get(&url)
            .query(&[("path", sub_path)])
            .header("authorization", &self.auth_key)
            .send()
            .await
            .map_err(|e| CrawlerError::network(format!("获取文件清单失败: {e}")))?;

        if !response.status().is_success() {
            return Err(CrawlerError::network(format!(
                "获取文件清单失败，状态码: {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct ScanResponse {
            data: FsFileInfoMap,
        }
        let body: ScanResponse = response
            .json()
            .await
            .map_err(|e| CrawlerError::Serialization(format!("解析文件清单失败: {e}")))?;
        Ok(body.data)
    }

    fn download_url(&self, sync_id: &str, path: &str) -> String {
        format!("{}/sync/{}/download?path={}", self.endpoint, sync_id, path)
    }
}

async fn download_file(
    http: &reqwest::Client,
    url: &str,
    auth_key: &str,
    target: &PathBuf,
) -> CrawlerResult<()> {
    debug!("下载文件: {}", url);
    let response = http
        .get(url)
        .header("authorization", auth_key)
        .send()
        .await
        .map_err(|e| CrawlerError::network(format!("下载请求失败: {e}")))?;

    if !response.status().is_success() {
        return Err(CrawlerError::network(format!(
            "下载失败 {url}: {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| CrawlerError::network(format!("读取下载内容失败: {e}")))?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CrawlerError::Internal(format!("创建目录失败: {e}")))?;
    }
    tokio::fs::write(target, &bytes)
        .await
        .map_err(|e| CrawlerError::Internal(format!("写入文件失败: {e}")))?;
    Ok(())
}
