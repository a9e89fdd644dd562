//! # 领域实体定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crawler_common::{oid, Id, DEFAULT_TASK_PRIORITY, NIL_ID, SYSTEM_USER};

// ============================================================================
// 任务相关实体
// ============================================================================

/// 任务状态
///
/// 状态机:
/// - pending → assigned → running → { finished | error | cancelled }
/// - pending → cancelled（派发前取消）
/// - 主节点重启时所有非终态任务 → abnormal
/// - assigned/running 可被取消驱动到 cancelled
///
/// 终态（finished/error/cancelled/abnormal）之后不允许任何状态变更。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Finished,
    Error,
    Cancelled,
    Abnormal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Abnormal => "abnormal",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "running" => Some(TaskStatus::Running),
            "finished" => Some(TaskStatus::Finished),
            "error" => Some(TaskStatus::Error),
            "cancelled" => Some(TaskStatus::Cancelled),
            "abnormal" => Some(TaskStatus::Abnormal),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished
                | TaskStatus::Error
                | TaskStatus::Cancelled
                | TaskStatus::Abnormal
        )
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Assigned | TaskStatus::Cancelled | TaskStatus::Abnormal
            ),
            TaskStatus::Assigned => matches!(
                next,
                TaskStatus::Running | TaskStatus::Cancelled | TaskStatus::Abnormal
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Finished
                    | TaskStatus::Error
                    | TaskStatus::Cancelled
                    | TaskStatus::Abnormal
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// SQLite 数据库类型支持 - TaskStatus
impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("无效的任务状态: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务运行模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RunMode {
    /// 任意一个可用节点执行
    #[default]
    #[serde(rename = "random")]
    Random,
    /// 所有活跃节点各执行一次
    #[serde(rename = "all")]
    AllNodes,
    /// 指定节点列表各执行一次
    #[serde(rename = "selected-nodes")]
    SelectedNodes,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Random => "random",
            RunMode::AllNodes => "all",
            RunMode::SelectedNodes => "selected-nodes",
        }
    }

    pub fn parse(s: &str) -> Option<RunMode> {
        match s {
            "random" => Some(RunMode::Random),
            "all" => Some(RunMode::AllNodes),
            "selected-nodes" => Some(RunMode::SelectedNodes),
            _ => None,
        }
    }
}

// SQLite 数据库类型支持 - RunMode
impl sqlx::Type<sqlx::Sqlite> for RunMode {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RunMode {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        RunMode::parse(s).ok_or_else(|| format!("无效的运行模式: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RunMode {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务
///
/// 表示一次爬虫执行的工作单元。`node_id` 为空字符串时表示任意节点可领取。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub spider_id: Id,
    pub node_id: Id,
    pub schedule_id: Id,
    pub status: TaskStatus,
    pub priority: i32,
    pub mode: RunMode,
    pub node_ids: Vec<Id>,
    pub cmd: String,
    pub param: String,
    pub pid: i64,
    pub error: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 创建一个待派发的新任务
    pub fn new(spider_id: Id, opts: &SpiderRunOptions) -> Self {
        let now = Utc::now();
        let by = if opts.user_id.is_empty() {
            SYSTEM_USER.to_string()
        } else {
            opts.user_id.clone()
        };
        Self {
            id: oid(),
            spider_id,
            node_id: NIL_ID.to_string(),
            schedule_id: opts.schedule_id.clone(),
            status: TaskStatus::Pending,
            priority: if opts.priority > 0 {
                opts.priority
            } else {
                DEFAULT_TASK_PRIORITY
            },
            mode: opts.mode,
            node_ids: opts.node_ids.clone(),
            cmd: opts.cmd.clone(),
            param: opts.param.clone(),
            pid: 0,
            error: String::new(),
            created_by: by.clone(),
            created_at: now,
            updated_by: by,
            updated_at: now,
        }
    }

    pub fn set_updated(&mut self, by: &str) {
        self.updated_by = by.to_string();
        self.updated_at = Utc::now();
    }
}

/// 任务统计（与任务一一对应，共用同一ID）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStat {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub wait_duration_ms: i64,
    pub runtime_duration_ms: i64,
    pub total_duration_ms: i64,
    pub result_count: i64,
}

impl TaskStat {
    pub fn new(task_id: Id) -> Self {
        Self {
            id: task_id,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            wait_duration_ms: 0,
            runtime_duration_ms: 0,
            total_duration_ms: 0,
            result_count: 0,
        }
    }

    /// 记录任务开始运行: 设置开始时间与等待时长
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.wait_duration_ms = (now - self.created_at).num_milliseconds();
    }

    /// 记录任务结束: 设置结束时间与运行/总时长
    ///
    /// 任务从未进入运行态就结束时（如取消），开始时间补记为结束时间。
    pub fn mark_ended(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.mark_started(now);
        }
        let started = self.started_at.unwrap_or(now);
        self.ended_at = Some(now);
        self.runtime_duration_ms = (now - started).num_milliseconds();
        self.total_duration_ms = (now - self.created_at).num_milliseconds();
    }
}

// ============================================================================
// 爬虫相关实体
// ============================================================================

/// 爬虫
///
/// 一个爬虫是可重复执行的抓取配方: 命令、参数与抓取数据的落库目标。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spider {
    pub id: Id,
    pub name: String,
    /// 抓取记录的落库集合名
    pub col_name: String,
    pub cmd: String,
    pub param: String,
    pub priority: i32,
    pub mode: RunMode,
    pub node_ids: Vec<Id>,
    /// 关联的Git仓库ID（为空表示非Git爬虫）
    pub git_id: Id,
    pub git_root_path: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Spider {
    pub fn new(name: &str, cmd: &str) -> Self {
        let now = Utc::now();
        Self {
            id: oid(),
            name: name.to_string(),
            col_name: format!("results_{name}"),
            cmd: cmd.to_string(),
            param: String::new(),
            priority: DEFAULT_TASK_PRIORITY,
            mode: RunMode::Random,
            node_ids: Vec::new(),
            git_id: NIL_ID.to_string(),
            git_root_path: String::new(),
            created_by: SYSTEM_USER.to_string(),
            created_at: now,
            updated_by: SYSTEM_USER.to_string(),
            updated_at: now,
        }
    }

    /// 任务工作目录相对工作区的路径
    pub fn workspace_rel_path(&self) -> String {
        if self.git_id.is_empty() {
            self.id.clone()
        } else if self.git_root_path.is_empty() {
            self.git_id.clone()
        } else {
            format!("{}/{}", self.git_id, self.git_root_path)
        }
    }
}

/// 爬虫聚合统计（与爬虫一一对应，共用同一ID）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderStat {
    pub id: Id,
    pub last_task_id: Id,
    pub tasks: i64,
    pub results: i64,
    pub wait_duration_ms: i64,
    /// 累计运行时长（秒）
    pub runtime_duration_s: i64,
    /// 累计总时长（秒）
    pub total_duration_s: i64,
}

// ============================================================================
// 调度计划相关实体
// ============================================================================

/// 调度计划
///
/// 不变量: `enabled ⇔ entry_id ≠ -1`，由调度服务在其互斥锁下与cron注册表
/// 原子维护。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Id,
    pub name: String,
    pub spider_id: Id,
    pub cron: String,
    pub enabled: bool,
    /// cron注册表中的条目句柄，-1表示未注册
    pub entry_id: i64,
    /// 运行模式覆盖，None时沿用爬虫配置
    pub mode: Option<RunMode>,
    pub node_ids: Vec<Id>,
    pub cmd: String,
    pub param: String,
    pub priority: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: &str, spider_id: Id, cron: &str) -> Self {
        let now = Utc::now();
        Self {
            id: oid(),
            name: name.to_string(),
            spider_id,
            cron: cron.to_string(),
            enabled: false,
            entry_id: -1,
            mode: None,
            node_ids: Vec::new(),
            cmd: String::new(),
            param: String::new(),
            priority: 0,
            created_by: SYSTEM_USER.to_string(),
            created_at: now,
            updated_by: SYSTEM_USER.to_string(),
            updated_at: now,
        }
    }

    /// 以爬虫默认值补全运行选项（计划字段为空则回退到爬虫配置）
    pub fn run_options(&self, spider: &Spider) -> SpiderRunOptions {
        let mut opts = SpiderRunOptions {
            mode: self.mode.unwrap_or(spider.mode),
            node_ids: self.node_ids.clone(),
            cmd: self.cmd.clone(),
            param: self.param.clone(),
            priority: self.priority,
            schedule_id: self.id.clone(),
            user_id: self.created_by.clone(),
        };
        if opts.node_ids.is_empty() {
            opts.node_ids = spider.node_ids.clone();
        }
        if opts.cmd.is_empty() {
            opts.cmd = spider.cmd.clone();
        }
        if opts.param.is_empty() {
            opts.param = spider.param.clone();
        }
        if opts.priority <= 0 {
            opts.priority = if spider.priority > 0 {
                spider.priority
            } else {
                DEFAULT_TASK_PRIORITY
            };
        }
        opts
    }
}

/// 爬虫运行选项
#[derive(Debug, Clone, Default)]
pub struct SpiderRunOptions {
    pub mode: RunMode,
    pub node_ids: Vec<Id>,
    pub cmd: String,
    pub param: String,
    pub priority: i32,
    pub schedule_id: Id,
    pub user_id: String,
}

impl SpiderRunOptions {
    /// 以爬虫默认值构造（手动触发一次运行时使用）
    pub fn from_spider(spider: &Spider) -> Self {
        Self {
            mode: spider.mode,
            node_ids: spider.node_ids.clone(),
            cmd: spider.cmd.clone(),
            param: spider.param.clone(),
            priority: if spider.priority > 0 {
                spider.priority
            } else {
                DEFAULT_TASK_PRIORITY
            },
            schedule_id: NIL_ID.to_string(),
            user_id: SYSTEM_USER.to_string(),
        }
    }
}

// ============================================================================
// 节点相关实体
// ============================================================================

/// 节点
///
/// 集群中的一个进程，恰好一个节点是主节点，其余为工作节点。
/// `key` 由节点自行选定并保持稳定，注册按 `key` 幂等插入。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub key: String,
    pub name: String,
    pub is_master: bool,
    pub active: bool,
    pub enabled: bool,
    /// 最大并发任务数，0表示不限制
    pub max_runners: i32,
    pub current_runners: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(key: &str, name: &str, is_master: bool, max_runners: i32) -> Self {
        let now = Utc::now();
        Self {
            id: oid(),
            key: key.to_string(),
            name: name.to_string(),
            is_master,
            active: true,
            enabled: true,
            max_runners,
            current_runners: 0,
            last_heartbeat: Some(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// 全局环境变量（注入到所有子进程）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentVar {
    pub id: Id,
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_values() {
        assert_eq!(TaskStatus::Pending.as_str(), "pending");
        assert_eq!(TaskStatus::Abnormal.as_str(), "abnormal");
        assert_eq!(TaskStatus::parse("cancelled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse("unknown"), None);
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Assigned.can_transition_to(Running));
        assert!(Assigned.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Error));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Abnormal));
        assert!(Running.can_transition_to(Abnormal));

        // 非法迁移
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Finished));
        assert!(!Assigned.can_transition_to(Finished));

        // 终态之后不允许任何迁移
        for terminal in [Finished, Error, Cancelled, Abnormal] {
            assert!(terminal.is_terminal());
            for next in [Pending, Assigned, Running, Finished, Error, Cancelled, Abnormal] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_run_mode_wire_values() {
        assert_eq!(RunMode::Random.as_str(), "random");
        assert_eq!(RunMode::AllNodes.as_str(), "all");
        assert_eq!(RunMode::SelectedNodes.as_str(), "selected-nodes");
        assert_eq!(RunMode::parse("selected-nodes"), Some(RunMode::SelectedNodes));
    }

    #[test]
    fn test_task_stat_durations() {
        let mut stat = TaskStat::new(oid());
        let created = stat.created_at;
        let started = created + chrono::Duration::milliseconds(120);
        let ended = started + chrono::Duration::milliseconds(880);

        stat.mark_started(started);
        assert_eq!(stat.wait_duration_ms, 120);

        stat.mark_ended(ended);
        assert_eq!(stat.runtime_duration_ms, 880);
        assert_eq!(stat.total_duration_ms, 1000);
        assert_eq!(
            stat.total_duration_ms,
            stat.wait_duration_ms + stat.runtime_duration_ms
        );
    }

    #[test]
    fn test_task_stat_ended_without_start() {
        let mut stat = TaskStat::new(oid());
        let ended = stat.created_at + chrono::Duration::milliseconds(500);
        stat.mark_ended(ended);
        // 从未运行的任务: 开始时间补记为结束时间，运行时长为0
        assert_eq!(stat.runtime_duration_ms, 0);
        assert_eq!(stat.wait_duration_ms, 500);
        assert_eq!(stat.total_duration_ms, 500);
    }

    #[test]
    fn test_schedule_run_options_fallback() {
        let spider = Spider::new("demo", "python main.py");
        let mut schedule = Schedule::new("每日", spider.id.clone(), "0 0 * * *");
        schedule.param = "--fast".to_string();

        let opts = schedule.run_options(&spider);
        assert_eq!(opts.cmd, "python main.py");
        assert_eq!(opts.param, "--fast");
        assert_eq!(opts.priority, DEFAULT_TASK_PRIORITY);
        assert_eq!(opts.schedule_id, schedule.id);
    }

    #[test]
    fn test_spider_workspace_path() {
        let mut spider = Spider::new("demo", "python main.py");
        assert_eq!(spider.workspace_rel_path(), spider.id);

        spider.git_id = "a".repeat(24);
        spider.git_root_path = "crawlers/demo".to_string();
        assert_eq!(
            spider.workspace_rel_path(),
            format!("{}/crawlers/demo", spider.git_id)
        );
    }
}
