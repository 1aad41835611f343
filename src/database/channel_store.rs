use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::models::channel::{split_csv, Channel, ChannelSetting, ChannelStatus, ChannelType};

/// 渠道读取与状态变更
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// 全部渠道（含禁用）
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    /// 已启用、属于 `group` 且声明了 `model` 的渠道
    async fn find_channels(&self, group: &str, model: &str) -> Result<Vec<Channel>>;

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>>;

    /// 修改渠道状态，状态未变化时返回 false
    async fn update_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: Option<String>,
    ) -> Result<bool>;

    /// 记录一次探测的耗时
    async fn record_test(&self, id: i64, response_time_ms: i64) -> Result<()>;

    async fn insert_channel(&self, channel: &Channel) -> Result<i64>;
}

pub struct SqliteChannelStore {
    pool: SqlitePool,
}

impl SqliteChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const CHANNEL_COLUMNS: &str = "id, type, name, status, base_url, key, models, groups, priority, \
     weight, auto_ban, model_mapping, setting, test_model, created_time";

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let type_code: i32 = row.try_get("type")?;
    let channel_type = ChannelType::try_from(type_code).map_err(anyhow::Error::msg)?;
    let status_code: i64 = row.try_get("status")?;
    let status = ChannelStatus::from_code(status_code)
        .with_context(|| format!("invalid channel status {}", status_code))?;
    let setting = match row.try_get::<Option<String>, _>("setting")? {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).context("invalid channel setting json")?
        }
        _ => ChannelSetting::default(),
    };
    let weight: i64 = row.try_get("weight")?;

    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        channel_type,
        status,
        base_url: row.try_get("base_url")?,
        key: row.try_get("key")?,
        models: split_csv(&row.try_get::<String, _>("models")?),
        groups: split_csv(&row.try_get::<String, _>("groups")?),
        priority: row.try_get("priority")?,
        weight: u32::try_from(weight.max(0)).unwrap_or(u32::MAX),
        auto_ban: row.try_get::<i64, _>("auto_ban")? != 0,
        model_mapping: row.try_get("model_mapping")?,
        setting,
        test_model: row.try_get("test_model")?,
        created_time: row.try_get("created_time")?,
    })
}

#[async_trait]
impl ChannelStore for SqliteChannelStore {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(&format!("SELECT {} FROM channels ORDER BY id", CHANNEL_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn find_channels(&self, group: &str, model: &str) -> Result<Vec<Channel>> {
        // models/groups 以逗号分隔存储，粗筛后在内存中精确匹配
        let rows = sqlx::query(&format!(
            "SELECT {} FROM channels WHERE status = ? AND models LIKE ? AND groups LIKE ? ORDER BY id",
            CHANNEL_COLUMNS
        ))
        .bind(ChannelStatus::Enabled.code())
        .bind(format!("%{}%", model))
        .bind(format!("%{}%", group))
        .fetch_all(&self.pool)
        .await?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in &rows {
            let channel = channel_from_row(row)?;
            if channel.serves_model(model) && channel.in_group(group) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE channels SET status = ?, status_reason = ? WHERE id = ? AND status != ?")
                .bind(status.code())
                .bind(reason)
                .bind(id)
                .bind(status.code())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_test(&self, id: i64, response_time_ms: i64) -> Result<()> {
        sqlx::query("UPDATE channels SET response_time = ?, test_time = ? WHERE id = ?")
            .bind(response_time_ms)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<i64> {
        let setting = serde_json::to_string(&channel.setting)?;
        let result = sqlx::query(
            "INSERT INTO channels (type, name, status, base_url, key, models, groups, priority, \
             weight, auto_ban, model_mapping, setting, test_model, created_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(channel.channel_type.code())
        .bind(&channel.name)
        .bind(channel.status.code())
        .bind(&channel.base_url)
        .bind(&channel.key)
        .bind(channel.models.join(","))
        .bind(channel.groups.join(","))
        .bind(channel.priority)
        .bind(i64::from(channel.weight))
        .bind(channel.auto_ban)
        .bind(&channel.model_mapping)
        .bind(setting)
        .bind(&channel.test_model)
        .bind(channel.created_time)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}
