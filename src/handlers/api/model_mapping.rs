use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::handlers::api::{AdminAuth, AdminResponse};
use crate::models::model_mapping::{GlobalModelMapping, MappingError};
use crate::routes::api::AppState;

/// 校验类错误返回400，存储失败返回500
fn mapping_error(err: MappingError) -> Response {
    let status = match err {
        MappingError::Storage(_) => {
            error!("模型映射持久化失败: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => {
            warn!("模型映射校验失败: {}", err);
            StatusCode::BAD_REQUEST
        }
    };
    (status, Json(AdminResponse::error(err.to_string()))).into_response()
}

/// 获取当前模型映射
#[utoipa::path(
    get,
    path = "/api/model_mapping",
    responses(
        (status = 200, description = "当前模型映射", body = AdminResponse),
        (status = 401, description = "未授权", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn get_model_mapping(_: AdminAuth, State(state): State<AppState>) -> Response {
    let snapshot = state.mapper.snapshot();
    match serde_json::to_value(snapshot.as_ref()) {
        Ok(data) => Json(AdminResponse::ok(data)).into_response(),
        Err(e) => mapping_error(MappingError::Parse(e)),
    }
}

/// 整体替换模型映射
#[utoipa::path(
    put,
    path = "/api/model_mapping",
    request_body = GlobalModelMapping,
    responses(
        (status = 200, description = "更新成功", body = AdminResponse),
        (status = 400, description = "映射不合法", body = AdminResponse),
        (status = 401, description = "未授权", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn update_model_mapping(
    _: AdminAuth,
    State(state): State<AppState>,
    payload: Result<Json<GlobalModelMapping>, JsonRejection>,
) -> Response {
    let mapping = match payload {
        Ok(Json(mapping)) => mapping,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(AdminResponse::error(format!("无效的请求: {}", e.body_text()))),
            )
                .into_response()
        }
    };
    match state.mapper.update(mapping).await {
        Ok(()) => Json(AdminResponse::message("模型映射已更新")).into_response(),
        Err(e) => mapping_error(e),
    }
}

/// 以JSON字符串形式获取模型映射
#[utoipa::path(
    get,
    path = "/api/model_mapping/config",
    responses(
        (status = 200, description = "映射配置字符串", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn get_model_mapping_config(_: AdminAuth, State(state): State<AppState>) -> Response {
    match state.mapper.to_json() {
        Ok(raw) => Json(AdminResponse::ok(json!(raw))).into_response(),
        Err(e) => mapping_error(e),
    }
}

/// 以原始JSON字符串更新模型映射，空内容或 `{}` 清空
#[utoipa::path(
    put,
    path = "/api/model_mapping/config",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "更新成功", body = AdminResponse),
        (status = 400, description = "映射不合法", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn update_model_mapping_config(
    _: AdminAuth,
    State(state): State<AppState>,
    body: String,
) -> Response {
    match state.mapper.update_from_json_str(&body).await {
        Ok(()) => Json(AdminResponse::message("模型映射已更新")).into_response(),
        Err(e) => mapping_error(e),
    }
}

/// 从配置表重新加载并重置轮询状态
#[utoipa::path(
    post,
    path = "/api/model_mapping/reload",
    responses(
        (status = 200, description = "重新加载成功", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn reload_model_mapping(_: AdminAuth, State(state): State<AppState>) -> Response {
    match state.mapper.reload().await {
        Ok(()) => {
            info!("管理员触发模型映射重新加载");
            Json(AdminResponse::message("模型映射已重新加载")).into_response()
        }
        Err(e) => mapping_error(e),
    }
}

#[utoipa::path(
    get,
    path = "/api/model_mapping/virtual_models",
    responses(
        (status = 200, description = "已配置的虚拟模型", body = AdminResponse),
    ),
    security(("bearer" = [])),
    tag = "model_mapping"
)]
pub async fn list_virtual_models(_: AdminAuth, State(state): State<AppState>) -> Response {
    Json(AdminResponse::ok(json!(state.mapper.virtual_models()))).into_response()
}
