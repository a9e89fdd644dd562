use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("节点未找到: {key}")]
    NodeNotFound { key: String },
    #[error("爬虫未找到: {id}")]
    SpiderNotFound { id: String },
    #[error("调度计划未找到: {id}")]
    ScheduleNotFound { id: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的输入: {0}")]
    InvalidInput(String),
    #[error("认证失败")]
    Unauthorized,
    #[error("服务不可用: {0}")]
    Unavailable(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("进程启动失败: {0}")]
    Spawn(String),
    #[error("操作冲突: {0}")]
    Conflict(String),
    #[error("任务队列已满: {len}/{cap}")]
    QueueFull { len: usize, cap: usize },
    #[error("取消任务超时: {task_id}")]
    CancelTimeout { task_id: String },
    #[error("网络错误: {0}")]
    Network(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CrawlerResult<T> = Result<T, CrawlerError>;

impl CrawlerError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn node_not_found<S: Into<String>>(key: S) -> Self {
        Self::NodeNotFound { key: key.into() }
    }
    pub fn spider_not_found<S: Into<String>>(id: S) -> Self {
        Self::SpiderNotFound { id: id.into() }
    }
    pub fn schedule_not_found<S: Into<String>>(id: S) -> Self {
        Self::ScheduleNotFound { id: id.into() }
    }
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlerError::DatabaseOperation(_)
                | CrawlerError::Network(_)
                | CrawlerError::Timeout(_)
                | CrawlerError::Unavailable(_)
        )
    }

    /// RPC应答中使用的稳定错误类别
    pub fn wire_kind(&self) -> &'static str {
        match self {
            CrawlerError::InvalidCron { .. } | CrawlerError::InvalidInput(_) => "invalid_input",
            CrawlerError::TaskNotFound { .. }
            | CrawlerError::NodeNotFound { .. }
            | CrawlerError::SpiderNotFound { .. }
            | CrawlerError::ScheduleNotFound { .. } => "not_found",
            CrawlerError::Unauthorized => "unauthorized",
            CrawlerError::Unavailable(_) => "unavailable",
            CrawlerError::Timeout(_) => "timeout",
            CrawlerError::Spawn(_) => "spawn",
            CrawlerError::Conflict(_) => "conflict",
            CrawlerError::QueueFull { .. } => "queue_full",
            CrawlerError::CancelTimeout { .. } => "cancel_timeout",
            _ => "internal",
        }
    }

    /// 从RPC应答中的错误类别还原错误
    pub fn from_wire(kind: &str, message: &str) -> Self {
        match kind {
            "invalid_input" => CrawlerError::InvalidInput(message.to_string()),
            "not_found" => CrawlerError::TaskNotFound {
                id: message.to_string(),
            },
            "unauthorized" => CrawlerError::Unauthorized,
            "unavailable" => CrawlerError::Unavailable(message.to_string()),
            "timeout" => CrawlerError::Timeout(message.to_string()),
            "spawn" => CrawlerError::Spawn(message.to_string()),
            "conflict" => CrawlerError::Conflict(message.to_string()),
            "cancel_timeout" => CrawlerError::CancelTimeout {
                task_id: message.to_string(),
            },
            _ => CrawlerError::Internal(message.to_string()),
        }
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(err: serde_json::Error) -> Self {
        CrawlerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CrawlerError {
    fn from(err: std::io::Error) -> Self {
        CrawlerError::Network(err.to_string())
    }
}

impl From<anyhow::Error> for CrawlerError {
    fn from(err: anyhow::Error) -> Self {
        CrawlerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_kind_mapping() {
        assert_eq!(CrawlerError::Unauthorized.wire_kind(), "unauthorized");
        assert_eq!(
            CrawlerError::invalid_input("bad mode").wire_kind(),
            "invalid_input"
        );
        assert_eq!(CrawlerError::task_not_found("abc").wire_kind(), "not_found");
        assert_eq!(
            CrawlerError::Spawn("no such file".to_string()).wire_kind(),
            "spawn"
        );
        assert_eq!(
            CrawlerError::QueueFull { len: 50, cap: 50 }.wire_kind(),
            "queue_full"
        );
    }

    #[test]
    fn test_from_wire_round_trip() {
        let err = CrawlerError::unavailable("circuit breaker open");
        let restored = CrawlerError::from_wire(err.wire_kind(), "circuit breaker open");
        assert!(matches!(restored, CrawlerError::Unavailable(_)));

        let restored = CrawlerError::from_wire("unauthorized", "");
        assert!(matches!(restored, CrawlerError::Unauthorized));
    }

    #[test]
    fn test_retryable() {
        assert!(CrawlerError::network("connection refused").is_retryable());
        assert!(CrawlerError::timeout("fetch_task").is_retryable());
        assert!(!CrawlerError::Unauthorized.is_retryable());
        assert!(!CrawlerError::invalid_input("x").is_retryable());
    }
}
