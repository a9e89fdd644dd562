//! # 基础设施层
//!
//! 领域仓储接口的参考实现: 嵌入式SQLite存储、文件日志驱动、抓取记录落库。
//! 更换存储后端时只需提供另一组仓储实现，上层服务不感知。

pub mod database;
pub mod log_storage;
pub mod notifier;
pub mod record_sink;

pub use database::{connect, migrate, sqlite_store};
pub use log_storage::FileLogStorage;
pub use notifier::NoopNotifier;
pub use record_sink::SqliteRecordSink;
