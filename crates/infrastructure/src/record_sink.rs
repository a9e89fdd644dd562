//! # 抓取记录落库
//!
//! 参考实现: 记录作为JSON文档写入SQLite的results表，按集合名分组。
//! 生产部署可替换为任意文档存储的 [`RecordSink`] 实现。

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crawler_common::oid;
use crawler_domain::RecordSink;
use crawler_errors::CrawlerResult;

pub struct SqliteRecordSink {
    pool: SqlitePool,
}

impl SqliteRecordSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self, col_name: &str) -> CrawlerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM results WHERE col_name = $1")
            .bind(col_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("cnt")?)
    }
}

#[async_trait]
impl RecordSink for SqliteRecordSink {
    async fn insert_records(
        &self,
        col_name: &str,
        records: &[serde_json::Value],
    ) -> CrawlerResult<u64> {
        let mut inserted = 0u64;
        let now = Utc::now();
        for record in records {
            if !record.is_object() {
                warn!("跳过非对象记录: {}", record);
                continue;
            }
            sqlx::query(
                "INSERT INTO results (id, col_name, data, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(oid())
            .bind(col_name)
            .bind(record.to_string())
            .bind(now)
            .execute(&self.pool)
            .await?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
