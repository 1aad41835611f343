use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// 全局模型映射在配置表中的键
pub const GLOBAL_MODEL_MAPPING_KEY: &str = "global_model_mapping";

/// 键值配置存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, key: &str) -> Result<Option<String>>;

    async fn set_option(&self, key: &str, value: &str) -> Result<()>;
}

pub struct SqliteOptionStore {
    pool: SqlitePool,
}

impl SqliteOptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OptionStore for SqliteOptionStore {
    async fn get_option(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM options WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO options (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connection::memory_pool;

    #[tokio::test]
    async fn set_option_upserts() {
        let store = SqliteOptionStore::new(memory_pool().await.unwrap());
        assert_eq!(store.get_option("k").await.unwrap(), None);
        store.set_option("k", "v1").await.unwrap();
        store.set_option("k", "v2").await.unwrap();
        assert_eq!(store.get_option("k").await.unwrap().as_deref(), Some("v2"));
    }
}
