pub mod auth;
pub mod channel;
pub mod model_mapping;
pub mod models;
pub mod relay;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub use auth::{AdminAuth, ClientToken};

/// 管理接口的统一响应
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdminResponse {
    /// 操作状态
    pub success: bool,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub data: Option<Value>,
}

impl AdminResponse {
    pub fn ok(data: impl Into<Option<Value>>) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: data.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}
