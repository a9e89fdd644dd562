use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crawler_domain::{Task, TaskRepository, TaskStatus};
use crawler_errors::{CrawlerError, CrawlerResult};

use super::{decode_ids, encode_ids};

const TASK_COLUMNS: &str = "id, spider_id, node_id, schedule_id, status, priority, mode, \
                            node_ids, cmd, param, pid, error, created_by, created_at, \
                            updated_by, updated_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> CrawlerResult<Task> {
        let node_ids: String = row.try_get("node_ids")?;
        Ok(Task {
            id: row.try_get("id")?,
            spider_id: row.try_get("spider_id")?,
            node_id: row.try_get("node_id")?,
            schedule_id: row.try_get("schedule_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            mode: row.try_get("mode")?,
            node_ids: decode_ids(&node_ids),
            cmd: row.try_get("cmd")?,
            param: row.try_get("param")?,
            pid: row.try_get("pid")?,
            error: row.try_get("error")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn status_placeholders(statuses: &[TaskStatus]) -> String {
        statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> CrawlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, spider_id, node_id, schedule_id, status, priority, mode,
                               node_ids, cmd, param, pid, error, created_by, created_at,
                               updated_by, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&task.id)
        .bind(&task.spider_id)
        .bind(&task.node_id)
        .bind(&task.schedule_id)
        .bind(task.status)
        .bind(task.priority)
        .bind(task.mode)
        .bind(encode_ids(&task.node_ids))
        .bind(&task.cmd)
        .bind(&task.param)
        .bind(task.pid)
        .bind(&task.error)
        .bind(&task.created_by)
        .bind(task.created_at)
        .bind(&task.updated_by)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("创建任务成功: {}", task.id);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, task: &Task) -> CrawlerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET spider_id = $2, node_id = $3, schedule_id = $4, status = $5, priority = $6,
                mode = $7, node_ids = $8, cmd = $9, param = $10, pid = $11, error = $12,
                updated_by = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(&task.spider_id)
        .bind(&task.node_id)
        .bind(&task.schedule_id)
        .bind(task.status)
        .bind(task.priority)
        .bind(task.mode)
        .bind(encode_ids(&task.node_ids))
        .bind(&task.cmd)
        .bind(&task.param)
        .bind(task.pid)
        .bind(&task.error)
        .bind(&task.updated_by)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::task_not_found(&task.id));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: &str,
        by: &str,
    ) -> CrawlerResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $2, error = $3, updated_by = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::task_not_found(id));
        }
        debug!("更新任务状态: {} -> {}", id, status);
        Ok(())
    }

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> CrawlerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({}) ORDER BY id",
            Self::status_placeholders(statuses)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_node_statuses(
        &self,
        node_id: &str,
        statuses: &[TaskStatus],
    ) -> CrawlerResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM tasks WHERE node_id = $1 AND status IN ({})",
            Self::status_placeholders(statuses)
        );
        let row = sqlx::query(&sql).bind(node_id).fetch_one(&self.pool).await?;
        Ok(row.try_get("cnt")?)
    }

    async fn claim_pending_task(&self, node_id: &str) -> CrawlerResult<Option<Task>> {
        let now = Utc::now();

        // 单条条件更新语句原子完成"查找+指派"，两个并发领取绝不会命中同一行。
        // 先领取指派给本节点的任务，按 (priority, id) 升序。
        let row = sqlx::query(&format!(
            "UPDATE tasks SET status = 'assigned', updated_at = $2 \
             WHERE id = (SELECT id FROM tasks WHERE node_id = $1 AND status = 'pending' \
                         ORDER BY priority ASC, id ASC LIMIT 1) \
               AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(node_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(Self::row_to_task(&row)?));
        }

        // 再领取不限定节点的任务，同时把它指派给本节点
        let row = sqlx::query(&format!(
            "UPDATE tasks SET status = 'assigned', node_id = $1, updated_at = $2 \
             WHERE id = (SELECT id FROM tasks WHERE node_id = '' AND status = 'pending' \
                         ORDER BY priority ASC, id ASC LIMIT 1) \
               AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(node_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
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
        let sql = format!("DELETE FROM tasks WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}
