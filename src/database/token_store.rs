use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::token::TokenInfo;

/// 客户端令牌查询
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find_token(&self, key: &str) -> Result<Option<TokenInfo>>;

    async fn insert_token(&self, key: &str, token: &TokenInfo) -> Result<i64>;
}

pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn find_token(&self, key: &str) -> Result<Option<TokenInfo>> {
        let row = sqlx::query(
            r#"SELECT id, name, "group", status, channel_id FROM tokens WHERE key = ?"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TokenInfo {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            group: row.try_get("group")?,
            enabled: row.try_get::<i64, _>("status")? == 1,
            channel_id: row.try_get("channel_id")?,
        }))
    }

    async fn insert_token(&self, key: &str, token: &TokenInfo) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO tokens (key, name, "group", status, channel_id) VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(key)
        .bind(&token.name)
        .bind(&token.group)
        .bind(if token.enabled { 1_i64 } else { 2_i64 })
        .bind(token.channel_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connection::memory_pool;

    #[tokio::test]
    async fn token_lookup_by_key() {
        let store = SqliteTokenStore::new(memory_pool().await.unwrap());
        let token = TokenInfo {
            id: 0,
            name: "ci".into(),
            group: "vip".into(),
            enabled: true,
            channel_id: None,
        };
        store.insert_token("sk-abc", &token).await.unwrap();

        let found = store.find_token("sk-abc").await.unwrap().unwrap();
        assert_eq!(found.group, "vip");
        assert!(found.enabled);
        assert!(!found.is_pinned());
        assert!(store.find_token("sk-missing").await.unwrap().is_none());
    }
}
