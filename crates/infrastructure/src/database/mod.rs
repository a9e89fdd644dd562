//! # 数据库接入
//!
//! SQLite连接池初始化与表结构建立。

pub mod sqlite;

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crawler_domain::Store;
use crawler_errors::{CrawlerError, CrawlerResult};

use sqlite::{
    SqliteEnvironmentRepository, SqliteNodeRepository, SqliteScheduleRepository,
    SqliteSpiderRepository, SqliteSpiderStatRepository, SqliteTaskRepository,
    SqliteTaskStatRepository,
};

/// 建立SQLite连接池
pub async fn connect(database_url: &str) -> CrawlerResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(CrawlerError::Database)?;
    info!("数据库连接成功: {}", database_url);
    Ok(pool)
}

/// 建立表结构（幂等）
pub async fn migrate(pool: &SqlitePool) -> CrawlerResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("数据库表结构就绪");
    Ok(())
}

/// 以SQLite实现组装仓储集合
pub fn sqlite_store(pool: SqlitePool) -> Store {
    Store {
        tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
        task_stats: Arc::new(SqliteTaskStatRepository::new(pool.clone())),
        spiders: Arc::new(SqliteSpiderRepository::new(pool.clone())),
        spider_stats: Arc::new(SqliteSpiderStatRepository::new(pool.clone())),
        schedules: Arc::new(SqliteScheduleRepository::new(pool.clone())),
        nodes: Arc::new(SqliteNodeRepository::new(pool.clone())),
        environments: Arc::new(SqliteEnvironmentRepository::new(pool)),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    spider_id   TEXT NOT NULL,
    node_id     TEXT NOT NULL DEFAULT '',
    schedule_id TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 5,
    mode        TEXT NOT NULL DEFAULT 'random',
    node_ids    TEXT NOT NULL DEFAULT '[]',
    cmd         TEXT NOT NULL DEFAULT '',
    param       TEXT NOT NULL DEFAULT '',
    pid         INTEGER NOT NULL DEFAULT 0,
    error       TEXT NOT NULL DEFAULT '',
    created_by  TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_by  TEXT NOT NULL DEFAULT '',
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, node_id, priority, id);

CREATE TABLE IF NOT EXISTS task_stats (
    id                  TEXT PRIMARY KEY,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    ended_at            TEXT,
    wait_duration_ms    INTEGER NOT NULL DEFAULT 0,
    runtime_duration_ms INTEGER NOT NULL DEFAULT 0,
    total_duration_ms   INTEGER NOT NULL DEFAULT 0,
    result_count        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS spiders (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    col_name      TEXT NOT NULL DEFAULT '',
    cmd           TEXT NOT NULL DEFAULT '',
    param         TEXT NOT NULL DEFAULT '',
    priority      INTEGER NOT NULL DEFAULT 5,
    mode          TEXT NOT NULL DEFAULT 'random',
    node_ids      TEXT NOT NULL DEFAULT '[]',
    git_id        TEXT NOT NULL DEFAULT '',
    git_root_path TEXT NOT NULL DEFAULT '',
    created_by    TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,
    updated_by    TEXT NOT NULL DEFAULT '',
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spider_stats (
    id                 TEXT PRIMARY KEY,
    last_task_id       TEXT NOT NULL DEFAULT '',
    tasks              INTEGER NOT NULL DEFAULT 0,
    results            INTEGER NOT NULL DEFAULT 0,
    wait_duration_ms   INTEGER NOT NULL DEFAULT 0,
    runtime_duration_s INTEGER NOT NULL DEFAULT 0,
    total_duration_s   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schedules (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL DEFAULT '',
    spider_id  TEXT NOT NULL,
    cron       TEXT NOT NULL,
    enabled    INTEGER NOT NULL DEFAULT 0,
    entry_id   INTEGER NOT NULL DEFAULT -1,
    mode       TEXT,
    node_ids   TEXT NOT NULL DEFAULT '[]',
    cmd        TEXT NOT NULL DEFAULT '',
    param      TEXT NOT NULL DEFAULT '',
    priority   INTEGER NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_by TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id              TEXT PRIMARY KEY,
    key             TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL DEFAULT '',
    is_master       INTEGER NOT NULL DEFAULT 0,
    active          INTEGER NOT NULL DEFAULT 1,
    enabled         INTEGER NOT NULL DEFAULT 1,
    max_runners     INTEGER NOT NULL DEFAULT 0,
    current_runners INTEGER NOT NULL DEFAULT 0,
    last_heartbeat  TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS environments (
    id    TEXT PRIMARY KEY,
    key   TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS results (
    id         TEXT PRIMARY KEY,
    col_name   TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_col ON results (col_name);
"#;
