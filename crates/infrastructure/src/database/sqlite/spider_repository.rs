use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crawler_domain::{Spider, SpiderRepository, SpiderStat, SpiderStatRepository};
use crawler_errors::{CrawlerError, CrawlerResult};

use super::{decode_ids, encode_ids};

pub struct SqliteSpiderRepository {
    pool: SqlitePool,
}

impl SqliteSpiderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_spider(row: &sqlx::sqlite::SqliteRow) -> CrawlerResult<Spider> {
        let node_ids: String = row.try_get("node_ids")?;
        Ok(Spider {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            col_name: row.try_get("col_name")?,
            cmd: row.try_get("cmd")?,
            param: row.try_get("param")?,
            priority: row.try_get("priority")?,
            mode: row.try_get("mode")?,
            node_ids: decode_ids(&node_ids),
            git_id: row.try_get("git_id")?,
            git_root_path: row.try_get("git_root_path")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SpiderRepository for SqliteSpiderRepository {
    async fn create(&self, spider: &Spider) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spiders (id, name, col_name, cmd, param, priority, mode, node_ids,
                                 git_id, git_root_path, created_by, created_at, updated_by,
                                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&spider.id)
        .bind(&spider.name)
        .bind(&spider.col_name)
        .bind(&spider.cmd)
        .bind(&spider.param)
        .bind(spider.priority)
        .bind(spider.mode)
        .bind(encode_ids(&spider.node_ids))
        .bind(&spider.git_id)
        .bind(&spider.git_root_path)
        .bind(&spider.created_by)
        .bind(spider.created_at)
        .bind(&spider.updated_by)
        .bind(spider.updated_at)
        .execute(&self.pool)
        .await?;

        // 聚合统计行随爬虫创建
        sqlx::query("INSERT OR IGNORE INTO spider_stats (id) VALUES ($1)")
            .bind(&spider.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Spider>> {
        let row = sqlx::query(
            "SELECT id, name, col_name, cmd, param, priority, mode, node_ids, git_id, \
             git_root_path, created_by, created_at, updated_by, updated_at \
             FROM spiders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_spider(&row)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, spider: &Spider) -> CrawlerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE spiders
            SET name = $2, col_name = $3, cmd = $4, param = $5, priority = $6, mode = $7,
                node_ids = $8, git_id = $9, git_root_path = $10, updated_by = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(&spider.id)
        .bind(&spider.name)
        .bind(&spider.col_name)
        .bind(&spider.cmd)
        .bind(&spider.param)
        .bind(spider.priority)
        .bind(spider.mode)
        .bind(encode_ids(&spider.node_ids))
        .bind(&spider.git_id)
        .bind(&spider.git_root_path)
        .bind(&spider.updated_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::spider_not_found(&spider.id));
        }
        Ok(())
    }
}

pub struct SqliteSpiderStatRepository {
    pool: SqlitePool,
}

impl SqliteSpiderStatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpiderStatRepository for SqliteSpiderStatRepository {
    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<SpiderStat>> {
        let row = sqlx::query(
            "SELECT id, last_task_id, tasks, results, wait_duration_ms, runtime_duration_s, \
             total_duration_s FROM spider_stats WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(SpiderStat {
                id: row.try_get("id")?,
                last_task_id: row.try_get("last_task_id")?,
                tasks: row.try_get("tasks")?,
                results: row.try_get("results")?,
                wait_duration_ms: row.try_get("wait_duration_ms")?,
                runtime_duration_s: row.try_get("runtime_duration_s")?,
                total_duration_s: row.try_get("total_duration_s")?,
            })),
            None => Ok(None),
        }
    }

    async fn apply_running(
        &self,
        spider_id: &str,
        task_id: &str,
        wait_duration_ms: i64,
    ) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spider_stats (id, last_task_id, tasks, wait_duration_ms)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT(id) DO UPDATE SET
                last_task_id = excluded.last_task_id,
                tasks = tasks + 1,
                wait_duration_ms = wait_duration_ms + excluded.wait_duration_ms
            "#,
        )
        .bind(spider_id)
        .bind(task_id)
        .bind(wait_duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_terminal(
        &self,
        spider_id: &str,
        task_id: &str,
        result_count: i64,
        runtime_duration_ms: i64,
        total_duration_ms: i64,
    ) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spider_stats (id, last_task_id, results, runtime_duration_s, total_duration_s)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(id) DO UPDATE SET
                last_task_id = excluded.last_task_id,
                results = results + excluded.results,
                runtime_duration_s = runtime_duration_s + excluded.runtime_duration_s,
                total_duration_s = total_duration_s + excluded.total_duration_s
            "#,
        )
        .bind(spider_id)
        .bind(task_id)
        .bind(result_count)
        .bind(runtime_duration_ms / 1000)
        .bind(total_duration_ms / 1000)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::test_pool;
    use crawler_common::oid;

    #[tokio::test]
    async fn test_spider_create_and_get() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteSpiderRepository::new(pool);

        let spider = Spider::new("news", "python crawl.py");
        repo.create(&spider).await.unwrap();

        let loaded = repo.get_by_id(&spider.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "news");
        assert_eq!(loaded.cmd, "python crawl.py");
        assert!(repo.get_by_id(&oid()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spider_stat_rollup() {
        let (pool, _dir) = test_pool().await;
        let spiders = SqliteSpiderRepository::new(pool.clone());
        let stats = SqliteSpiderStatRepository::new(pool);

        let spider = Spider::new("news", "python crawl.py");
        spiders.create(&spider).await.unwrap();

        let t1 = oid();
        stats.apply_running(&spider.id, &t1, 150).await.unwrap();
        stats
            .apply_terminal(&spider.id, &t1, 42, 3000, 3150)
            .await
            .unwrap();

        let stat = stats.get_by_id(&spider.id).await.unwrap().unwrap();
        assert_eq!(stat.tasks, 1);
        assert_eq!(stat.results, 42);
        assert_eq!(stat.wait_duration_ms, 150);
        assert_eq!(stat.runtime_duration_s, 3);
        assert_eq!(stat.last_task_id, t1);
    }
}
