//! # 系统常量定义

/// 系统名称
pub const SYSTEM_NAME: &str = "crawler-platform";

/// 空ID（表示"任意节点"或"未设置"）
pub const NIL_ID: &str = "";

/// 默认任务优先级
pub const DEFAULT_TASK_PRIORITY: i32 = 5;

/// 最小任务优先级（最先派发）
pub const MIN_TASK_PRIORITY: i32 = 1;

/// 最大任务优先级
pub const MAX_TASK_PRIORITY: i32 = 10;

/// 注入子进程前需要剔除的环境变量前缀
pub const ENV_PREFIX: &str = "CRAWLER_";

/// 子进程环境变量: 任务ID
pub const TASK_ID_ENV_KEY: &str = "CRAWLER_TASK_ID";

/// 子进程环境变量: 父进程PID
pub const PARENT_PID_ENV_KEY: &str = "CRAWLER_PARENT_PID";

/// 抓取记录注入字段: 任务ID
pub const TASK_KEY_FIELD: &str = "_tid";

/// 抓取记录注入字段: 爬虫ID
pub const SPIDER_KEY_FIELD: &str = "_sid";

/// 系统操作者标识（审计字段）
pub const SYSTEM_USER: &str = "system";
