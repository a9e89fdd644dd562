use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crawler_domain::{TaskStat, TaskStatRepository};
use crawler_errors::{CrawlerError, CrawlerResult};

pub struct SqliteTaskStatRepository {
    pool: SqlitePool,
}

impl SqliteTaskStatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_stat(row: &sqlx::sqlite::SqliteRow) -> CrawlerResult<TaskStat> {
        Ok(TaskStat {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            wait_duration_ms: row.try_get("wait_duration_ms")?,
            runtime_duration_ms: row.try_get("runtime_duration_ms")?,
            total_duration_ms: row.try_get("total_duration_ms")?,
            result_count: row.try_get("result_count")?,
        })
    }
}

#[async_trait]
impl TaskStatRepository for SqliteTaskStatRepository {
    async fn create(&self, stat: &TaskStat) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_stats (id, created_at, started_at, ended_at, wait_duration_ms,
                                    runtime_duration_ms, total_duration_ms, result_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&stat.id)
        .bind(stat.created_at)
        .bind(stat.started_at)
        .bind(stat.ended_at)
        .bind(stat.wait_duration_ms)
        .bind(stat.runtime_duration_ms)
        .bind(stat.total_duration_ms)
        .bind(stat.result_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<TaskStat>> {
        let row = sqlx::query(
            "SELECT id, created_at, started_at, ended_at, wait_duration_ms, \
             runtime_duration_ms, total_duration_ms, result_count \
             FROM task_stats WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_stat(&row)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, stat: &TaskStat) -> CrawlerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_stats
            SET started_at = $2, ended_at = $3, wait_duration_ms = $4,
                runtime_duration_ms = $5, total_duration_ms = $6, result_count = $7
            WHERE id = $1
            "#,
        )
        .bind(&stat.id)
        .bind(stat.started_at)
        .bind(stat.ended_at)
        .bind(stat.wait_duration_ms)
        .bind(stat.runtime_duration_ms)
        .bind(stat.total_duration_ms)
        .bind(stat.result_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::task_not_found(&stat.id));
        }
        Ok(())
    }

    async fn inc_result_count(&self, id: &str, n: i64) -> CrawlerResult<()> {
        sqlx::query("UPDATE task_stats SET result_count = result_count + $2 WHERE id = $1")
            .bind(id)
            .bind(n)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_ids_created_before(&self, t: DateTime<Utc>) -> CrawlerResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM task_stats WHERE created_at < $1")
            .bind(t)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(CrawlerError::Database))
            .collect()
    }

    async fn delete_many(&self, ids: &[String]) -> CrawlerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("${}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("DELETE FROM task_stats WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::test_pool;
    use crawler_common::oid;

    #[tokio::test]
    async fn test_stat_lifecycle() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteTaskStatRepository::new(pool);

        let mut stat = TaskStat::new(oid());
        repo.create(&stat).await.unwrap();

        let started = stat.created_at + chrono::Duration::milliseconds(50);
        stat.mark_started(started);
        stat.mark_ended(started + chrono::Duration::milliseconds(200));
        repo.update(&stat).await.unwrap();

        let loaded = repo.get_by_id(&stat.id).await.unwrap().unwrap();
        assert_eq!(loaded.wait_duration_ms, 50);
        assert_eq!(loaded.runtime_duration_ms, 200);
        assert_eq!(loaded.total_duration_ms, 250);
    }

    #[tokio::test]
    async fn test_inc_result_count() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteTaskStatRepository::new(pool);

        let stat = TaskStat::new(oid());
        repo.create(&stat).await.unwrap();
        repo.inc_result_count(&stat.id, 7).await.unwrap();
        repo.inc_result_count(&stat.id, 3).await.unwrap();

        let loaded = repo.get_by_id(&stat.id).await.unwrap().unwrap();
        assert_eq!(loaded.result_count, 10);
    }

    #[tokio::test]
    async fn test_gc_query_and_delete() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteTaskStatRepository::new(pool);

        let old = TaskStat {
            created_at: Utc::now() - chrono::Duration::days(40),
            ..TaskStat::new(oid())
        };
        let fresh = TaskStat::new(oid());
        repo.create(&old).await.unwrap();
        repo.create(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let ids = repo.get_ids_created_before(cutoff).await.unwrap();
        assert_eq!(ids, vec![old.id.clone()]);

        repo.delete_many(&ids).await.unwrap();
        assert!(repo.get_by_id(&old.id).await.unwrap().is_none());
        assert!(repo.get_by_id(&fresh.id).await.unwrap().is_some());
    }
}
