//! SQLite仓储实现

mod environment_repository;
mod node_repository;
mod schedule_repository;
mod spider_repository;
mod task_repository;
mod task_stat_repository;

pub use environment_repository::SqliteEnvironmentRepository;
pub use node_repository::SqliteNodeRepository;
pub use schedule_repository::SqliteScheduleRepository;
pub use spider_repository::{SqliteSpiderRepository, SqliteSpiderStatRepository};
pub use task_repository::SqliteTaskRepository;
pub use task_stat_repository::SqliteTaskStatRepository;

/// node_ids等列表字段以JSON文本落库
pub(crate) fn encode_ids(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_ids(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
