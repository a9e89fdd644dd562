use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crawler_domain::{Schedule, ScheduleRepository};
use crawler_errors::{CrawlerError, CrawlerResult};

use super::{decode_ids, encode_ids};

const SCHEDULE_COLUMNS: &str = "id, name, spider_id, cron, enabled, entry_id, mode, node_ids, \
                                cmd, param, priority, created_by, created_at, updated_by, \
                                updated_at";

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> CrawlerResult<Schedule> {
        let node_ids: String = row.try_get("node_ids")?;
        Ok(Schedule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            spider_id: row.try_get("spider_id")?,
            cron: row.try_get("cron")?,
            enabled: row.try_get("enabled")?,
            entry_id: row.try_get("entry_id")?,
            mode: row.try_get("mode")?,
            node_ids: decode_ids(&node_ids),
            cmd: row.try_get("cmd")?,
            param: row.try_get("param")?,
            priority: row.try_get("priority")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, spider_id, cron, enabled, entry_id, mode, node_ids,
                                   cmd, param, priority, created_by, created_at, updated_by,
                                   updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.spider_id)
        .bind(&schedule.cron)
        .bind(schedule.enabled)
        .bind(schedule.entry_id)
        .bind(schedule.mode)
        .bind(encode_ids(&schedule.node_ids))
        .bind(&schedule.cmd)
        .bind(&schedule.param)
        .bind(schedule.priority)
        .bind(&schedule.created_by)
        .bind(schedule.created_at)
        .bind(&schedule.updated_by)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_schedule(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_enabled(&self) -> CrawlerResult<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn update(&self, schedule: &Schedule) -> CrawlerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET name = $2, spider_id = $3, cron = $4, enabled = $5, entry_id = $6, mode = $7,
                node_ids = $8, cmd = $9, param = $10, priority = $11, updated_by = $12,
                updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.spider_id)
        .bind(&schedule.cron)
        .bind(schedule.enabled)
        .bind(schedule.entry_id)
        .bind(schedule.mode)
        .bind(encode_ids(&schedule.node_ids))
        .bind(&schedule.cmd)
        .bind(&schedule.param)
        .bind(schedule.priority)
        .bind(&schedule.updated_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::schedule_not_found(&schedule.id));
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        entry_id: i64,
        by: &str,
    ) -> CrawlerResult<()> {
        let result = sqlx::query(
            "UPDATE schedules SET enabled = $2, entry_id = $3, updated_by = $4, updated_at = $5 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(enabled)
        .bind(entry_id)
        .bind(by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::schedule_not_found(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::test_pool;
    use crawler_common::oid;

    #[tokio::test]
    async fn test_schedule_enabled_entry_id() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteScheduleRepository::new(pool);

        let schedule = Schedule::new("每小时", oid(), "0 * * * *");
        repo.create(&schedule).await.unwrap();
        assert!(repo.get_enabled().await.unwrap().is_empty());

        repo.set_enabled(&schedule.id, true, 3, "u1").await.unwrap();
        let enabled = repo.get_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].entry_id, 3);
        assert!(enabled[0].enabled);

        repo.set_enabled(&schedule.id, false, -1, "u1").await.unwrap();
        assert!(repo.get_enabled().await.unwrap().is_empty());
        let loaded = repo.get_by_id(&schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.entry_id, -1);
    }
}
