use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crawler_domain::{EnvironmentRepository, EnvironmentVar};
use crawler_errors::{CrawlerError, CrawlerResult};

pub struct SqliteEnvironmentRepository {
    pool: SqlitePool,
}

impl SqliteEnvironmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvironmentRepository for SqliteEnvironmentRepository {
    async fn get_all(&self) -> CrawlerResult<Vec<EnvironmentVar>> {
        let rows = sqlx::query("SELECT id, key, value FROM environments ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(EnvironmentVar {
                    id: row.try_get("id").map_err(CrawlerError::Database)?,
                    key: row.try_get("key").map_err(CrawlerError::Database)?,
                    value: row.try_get("value").map_err(CrawlerError::Database)?,
                })
            })
            .collect()
    }
}
