use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::dto::{ModelList, ModelObject};
use crate::error::RelayError;
use crate::handlers::api::auth::{request_id, ClientToken};
use crate::relay::RelayFormat;
use crate::routes::api::AppState;

/// 当前令牌分组可用的模型列表（OpenAI格式）
pub async fn list_models(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
) -> Response {
    match state.relay.available_models(&token.0.group).await {
        Ok(models) => {
            let data = models
                .into_iter()
                .map(|id| ModelObject {
                    owned_by: if state.mapper.is_virtual(&id) {
                        "virtual".to_string()
                    } else {
                        "system".to_string()
                    },
                    id,
                    object: "model".to_string(),
                    created: 0,
                })
                .collect();
            Json(ModelList {
                object: "list".to_string(),
                data,
            })
            .into_response()
        }
        Err(e) => {
            error!("获取模型列表失败: {}", e);
            RelayError::local(
                StatusCode::INTERNAL_SERVER_ERROR,
                "list_models_failed",
                "failed to list models",
            )
            .into_response_with(RelayFormat::OpenAI, &request_id(&headers))
        }
    }
}
