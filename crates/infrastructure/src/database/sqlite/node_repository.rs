use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crawler_domain::{Node, NodeRepository};
use crawler_errors::{CrawlerError, CrawlerResult};

const NODE_COLUMNS: &str = "id, key, name, is_master, active, enabled, max_runners, \
                            current_runners, last_heartbeat, created_at, updated_at";

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> CrawlerResult<Node> {
        Ok(Node {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            name: row.try_get("name")?,
            is_master: row.try_get("is_master")?,
            active: row.try_get("active")?,
            enabled: row.try_get("enabled")?,
            max_runners: row.try_get("max_runners")?,
            current_runners: row.try_get("current_runners")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn upsert(&self, node: &Node) -> CrawlerResult<Node> {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, key, name, is_master, active, enabled, max_runners,
                               current_runners, last_heartbeat, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                is_master = excluded.is_master,
                active = 1,
                max_runners = excluded.max_runners,
                last_heartbeat = excluded.last_heartbeat,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&node.id)
        .bind(&node.key)
        .bind(&node.name)
        .bind(node.is_master)
        .bind(node.active)
        .bind(node.enabled)
        .bind(node.max_runners)
        .bind(node.current_runners)
        .bind(node.last_heartbeat)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("节点注册: {}", node.key);
        self.get_by_key(&node.key)
            .await?
            .ok_or_else(|| CrawlerError::node_not_found(&node.key))
    }

    async fn get_by_id(&self, id: &str) -> CrawlerResult<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_key(&self, key: &str) -> CrawlerResult<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_active_nodes(&self) -> CrawlerResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE active = 1 AND enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> CrawlerResult<()> {
        let result = sqlx::query(
            "UPDATE nodes SET last_heartbeat = $2, active = 1, updated_at = $2 WHERE key = $1",
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrawlerError::node_not_found(key));
        }
        Ok(())
    }

    async fn set_current_runners(&self, id: &str, n: i32) -> CrawlerResult<()> {
        sqlx::query("UPDATE nodes SET current_runners = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(n)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
