//! # 应用配置
//!
//! TOML配置文件 + `CRAWLER_` 前缀环境变量覆盖。所有字段都有合理默认值，
//! 零配置即可以嵌入式模式启动（主节点 + 内嵌工作节点 + SQLite）。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crawler_errors::{CrawlerError, CrawlerResult};

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// 节点稳定标识，注册与心跳按此键幂等
    pub key: String,
    pub name: String,
    pub is_master: bool,
    /// 最大并发任务数，0表示不限制
    pub max_runners: i32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            key: format!("node-{host}"),
            name: host,
            is_master: false,
            max_runners: 0,
        }
    }
}

/// 主节点地址配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    pub host: String,
    /// RPC服务端口
    pub rpc_port: u16,
    /// 文件同步HTTP服务端口
    pub http_port: u16,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: 9666,
            http_port: 8000,
        }
    }
}

impl MasterSettings {
    pub fn rpc_address(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    pub fn api_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

/// 工作节点行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// 任务领取间隔（毫秒）
    pub fetch_interval_ms: u64,
    /// FetchTask调用超时（秒）
    pub fetch_timeout_secs: u64,
    /// 节点状态上报间隔（秒）
    pub report_interval_secs: u64,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 取消任务的最大等待时间（秒）
    pub cancel_timeout_secs: u64,
    /// 优雅终止到强制杀死的升级等待（秒）
    pub terminate_grace_secs: u64,
    /// 任务池最大并发工作协程数，-1表示不限制
    pub max_workers: i32,
    /// 任务队列容量，0表示按max_workers自动计算
    pub queue_size: usize,
    /// 下行流接收超时（秒）
    pub stream_recv_timeout_secs: u64,
    /// 同时保持的下行流数量上限
    pub max_streams: usize,
    /// 进程健康检查间隔（秒）
    pub process_health_interval_secs: u64,
    /// 上行流健康检查间隔（秒）
    pub conn_health_interval_secs: u64,
    /// IPC消息发送超时（秒）
    pub ipc_timeout_secs: u64,
    /// 注入子进程PATH的工具目录（Python/Node/Go等运行时）
    pub tool_paths: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            fetch_interval_ms: 1000,
            fetch_timeout_secs: 15,
            report_interval_secs: 5,
            heartbeat_interval_secs: 15,
            cancel_timeout_secs: 60,
            terminate_grace_secs: 15,
            max_workers: -1,
            queue_size: 0,
            stream_recv_timeout_secs: 30,
            max_streams: 50,
            process_health_interval_secs: 5,
            conn_health_interval_secs: 60,
            ipc_timeout_secs: 60,
            tool_paths: Vec::new(),
        }
    }
}

impl WorkerSettings {
    /// 任务队列的实际容量
    pub fn effective_queue_size(&self) -> usize {
        if self.queue_size > 0 {
            return self.queue_size;
        }
        if self.max_workers < 0 {
            return 1000;
        }
        std::cmp::max(50, self.max_workers as usize * 5)
    }
}

/// RPC连接管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// 连接状态监测间隔（秒）
    pub state_monitor_interval_secs: u64,
    /// 应用层健康探测间隔（秒）
    pub health_check_interval_secs: u64,
    /// Idle状态宽限期（秒）
    pub idle_grace_secs: u64,
    /// 熔断器连续失败阈值
    pub cb_max_failures: u32,
    /// 熔断器打开后的冷却时间（秒）
    pub cb_reset_secs: u64,
    /// 半开状态的重试间隔（秒）
    pub cb_half_open_retry_secs: u64,
    /// 单次建连超时（秒）
    pub connect_timeout_secs: u64,
    /// stub获取的默认等待超时（秒）
    pub client_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            state_monitor_interval_secs: 5,
            health_check_interval_secs: 120,
            idle_grace_secs: 120,
            cb_max_failures: 5,
            cb_reset_secs: 120,
            cb_half_open_retry_secs: 30,
            connect_timeout_secs: 30,
            client_timeout_secs: 5,
        }
    }
}

/// 主节点调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// 调度计划对账间隔（秒）
    pub update_interval_secs: u64,
    /// 任务GC扫描间隔（秒）
    pub gc_interval_secs: u64,
    /// 任务保留天数
    pub task_retention_days: i64,
    /// 订阅流清扫间隔（秒）
    pub stream_sweep_interval_secs: u64,
    /// 单个订阅流的最长保持时间（秒）
    pub stream_max_age_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            gc_interval_secs: 1800,
            task_retention_days: 30,
            stream_sweep_interval_secs: 600,
            stream_max_age_secs: 24 * 3600,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSettings,
    pub master: MasterSettings,
    pub worker: WorkerSettings,
    pub connection: ConnectionSettings,
    pub scheduler: SchedulerSettings,
    /// 爬虫文件工作区根目录
    pub workspace: String,
    /// 主从共享密钥
    pub auth_key: String,
    /// SQLite数据库地址
    pub database_url: String,
    /// 任务日志根目录
    pub log_dir: String,
}

impl AppConfig {
    /// 加载配置: 默认值 ← TOML文件 ← 环境变量
    pub fn load(path: Option<&Path>) -> CrawlerResult<AppConfig> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    CrawlerError::config_error(format!("读取配置文件失败 {}: {e}", p.display()))
                })?;
                toml::from_str(&content)
                    .map_err(|e| CrawlerError::config_error(format!("解析配置文件失败: {e}")))?
            }
            Some(p) => {
                return Err(CrawlerError::config_error(format!(
                    "配置文件不存在: {}",
                    p.display()
                )))
            }
            None => AppConfig::default(),
        };

        config.apply_env_overrides();
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRAWLER_NODE_KEY") {
            self.node.key = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_NODE_NAME") {
            self.node.name = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_IS_MASTER") {
            self.node.is_master = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CRAWLER_MASTER_HOST") {
            self.master.host = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_RPC_PORT") {
            if let Ok(port) = v.parse() {
                self.master.rpc_port = port;
            }
        }
        if let Ok(v) = std::env::var("CRAWLER_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.master.http_port = port;
            }
        }
        if let Ok(v) = std::env::var("CRAWLER_AUTH_KEY") {
            self.auth_key = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_WORKSPACE") {
            self.workspace = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_LOG_DIR") {
            self.log_dir = v;
        }
    }

    fn fill_defaults(&mut self) {
        if self.workspace.is_empty() {
            self.workspace = "./workspace".to_string();
        }
        if self.auth_key.is_empty() {
            self.auth_key = "crawler-platform".to_string();
        }
        if self.database_url.is_empty() {
            self.database_url = "sqlite://crawler.db?mode=rwc".to_string();
        }
        if self.log_dir.is_empty() {
            self.log_dir = "./logs".to_string();
        }
    }

    pub fn validate(&self) -> CrawlerResult<()> {
        if self.node.key.is_empty() {
            return Err(CrawlerError::config_error("node.key 不能为空"));
        }
        if self.node.max_runners < 0 {
            return Err(CrawlerError::config_error("node.max_runners 不能为负数"));
        }
        if self.worker.max_workers < -1 {
            return Err(CrawlerError::config_error(
                "worker.max_workers 只能为-1（不限制）或非负数",
            ));
        }
        if self.connection.cb_max_failures == 0 {
            return Err(CrawlerError::config_error(
                "connection.cb_max_failures 必须大于0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = AppConfig::default();
        config.fill_defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.master.rpc_port, 9666);
        assert_eq!(config.connection.cb_max_failures, 5);
        assert_eq!(config.worker.heartbeat_interval_secs, 15);
    }

    #[test]
    fn test_effective_queue_size() {
        let mut w = WorkerSettings::default();
        assert_eq!(w.effective_queue_size(), 1000); // max_workers = -1

        w.max_workers = 4;
        assert_eq!(w.effective_queue_size(), 50); // max(50, 4*5)

        w.max_workers = 20;
        assert_eq!(w.effective_queue_size(), 100); // max(50, 20*5)

        w.queue_size = 7;
        assert_eq!(w.effective_queue_size(), 7); // 显式配置优先
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
auth_key = "s3cret"
workspace = "/data/spiders"

[node]
key = "worker-01"
is_master = false
max_runners = 4

[master]
host = "10.0.0.1"
rpc_port = 7777
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.key, "worker-01");
        assert_eq!(config.node.max_runners, 4);
        assert_eq!(config.master.rpc_address(), "10.0.0.1:7777");
        assert_eq!(config.auth_key, "s3cret");
        assert_eq!(config.workspace, "/data/spiders");
        // 未指定的段落保持默认值
        assert_eq!(config.worker.fetch_interval_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
    }
}
