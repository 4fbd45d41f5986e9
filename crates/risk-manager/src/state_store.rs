use anyhow::Result;

/// Durable key-value state shared by the cooldown tracker, the position book
/// and the agent metrics.
#[derive(Clone)]
pub struct StateStore {
    db_pool: sqlx::AnyPool,
}

impl StateStore {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    /// Initialize the state table.
    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    /// Save a state key-value pair.
    pub async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Load a state value by key.
    pub async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn delete_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_state WHERE key = ?")
            .bind(key)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// All (key, value) pairs whose key starts with `prefix`, ordered by key.
    pub async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM agent_state WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.len() as i64)
        .bind(prefix)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows)
    }

    /// Persist metrics to DB for recovery after restart.
    pub async fn save_metrics(&self, metrics_json: &serde_json::Value) -> Result<()> {
        let json_str = serde_json::to_string(metrics_json)?;
        self.save_state("agent_metrics", &json_str).await
    }

    /// Load persisted metrics.
    pub async fn load_metrics(&self) -> Result<Option<serde_json::Value>> {
        match self.load_state("agent_metrics").await? {
            Some(s) => Ok(serde_json::from_str(&s).ok()),
            None => Ok(None),
        }
    }
}
