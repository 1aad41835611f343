use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info};

use crate::handlers::api::{AdminAuth, AdminResponse};
use crate::routes::api::AppState;

/// 清空渠道选择缓存
#[utoipa::path(
    post,
    path = "/api/channel/cache/refresh",
    responses(
        (status = 200, description = "缓存已清空", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "channel"
)]
pub async fn refresh_channel_cache(_: AdminAuth, State(state): State<AppState>) -> Response {
    state.selector.invalidate_all();
    info!("渠道选择缓存已清空");
    Json(AdminResponse::message("渠道缓存已刷新")).into_response()
}

/// 手动探测渠道
#[utoipa::path(
    get,
    path = "/api/channel/test/{id}",
    params(("id" = i64, Path, description = "渠道ID")),
    responses(
        (status = 200, description = "探测结果", body = AdminResponse),
        (status = 404, description = "渠道不存在", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "channel"
)]
pub async fn test_channel(
    _: AdminAuth,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    match state.tester.test_channel(id).await {
        Ok(Some(result)) => {
            let response = AdminResponse {
                success: result.success,
                message: result.message.clone(),
                data: serde_json::to_value(&result).ok(),
            };
            Json(response).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(AdminResponse::error(format!("渠道 #{} 不存在", id))),
        )
            .into_response(),
        Err(e) => {
            error!("探测渠道 #{} 失败: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AdminResponse::error(format!("探测渠道失败: {}", e))),
            )
                .into_response()
        }
    }
}
