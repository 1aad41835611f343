//! Realtime websocket 转发

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::dto::Usage;
use crate::error::RelayError;
use crate::relay::helper::parse_error_body;
use crate::relay::{AdaptorRegistry, RelayInfo};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 与上游建立 websocket 连接，握手失败按普通上游错误处理
pub async fn connect_upstream(
    registry: &AdaptorRegistry,
    info: &RelayInfo,
) -> Result<UpstreamSocket, RelayError> {
    let adaptor = registry.adaptor_for(info)?;
    let url = adaptor.realtime_url(info)?;
    let mut headers = HeaderMap::new();
    adaptor.build_headers(info, &mut headers).await?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::bad_request(format!("invalid realtime url: {}", e)))?;
    for (name, value) in headers.iter() {
        let name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|e| RelayError::bad_request(e.to_string()))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| RelayError::bad_request(e.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    if info.proxy.is_some() {
        warn!(
            "realtime 连接暂不走渠道代理 [{}]: channel_id={}",
            info.request_id, info.channel_id
        );
    }

    debug!(
        "连接上游 realtime [{}]: channel_id={}, url={}",
        info.request_id, info.channel_id, url
    );
    match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(WsError::Http(response)) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            Err(RelayError::upstream(status, parse_error_body(status, &body)))
        }
        Err(e) => Err(RelayError::Transport(format!("realtime handshake failed: {}", e))),
    }
}

fn to_upstream(message: AxumMessage) -> WsMessage {
    match message {
        AxumMessage::Text(text) => WsMessage::Text(text),
        AxumMessage::Binary(data) => WsMessage::Binary(data),
        AxumMessage::Ping(data) => WsMessage::Ping(data),
        AxumMessage::Pong(data) => WsMessage::Pong(data),
        AxumMessage::Close(frame) => WsMessage::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

fn to_client(message: WsMessage) -> Option<AxumMessage> {
    let message = match message {
        WsMessage::Text(text) => AxumMessage::Text(text),
        WsMessage::Binary(data) => AxumMessage::Binary(data),
        WsMessage::Ping(data) => AxumMessage::Ping(data),
        WsMessage::Pong(data) => AxumMessage::Pong(data),
        WsMessage::Close(frame) => AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        })),
        WsMessage::Frame(_) => return None,
    };
    Some(message)
}

/// `response.done` 事件里的用量
pub fn usage_from_event(text: &str) -> Option<Usage> {
    let event: Value = serde_json::from_str(text).ok()?;
    if event["type"] != "response.done" {
        return None;
    }
    let usage = &event["response"]["usage"];
    Some(Usage::new(
        usage["input_tokens"].as_u64().unwrap_or(0) as u32,
        usage["output_tokens"].as_u64().unwrap_or(0) as u32,
    ))
}

/// 双向转发直到任意一端关闭
pub async fn pump(client: WebSocket, upstream: UpstreamSocket, info: RelayInfo) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let request_id = info.request_id.clone();
    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let closing = matches!(message, AxumMessage::Close(_));
            if upstream_tx.send(to_upstream(message)).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        let mut total = Usage::default();
        while let Some(Ok(message)) = upstream_rx.next().await {
            if let WsMessage::Text(text) = &message {
                if let Some(usage) = usage_from_event(text) {
                    total = Usage::new(
                        total.prompt_tokens + usage.prompt_tokens,
                        total.completion_tokens + usage.completion_tokens,
                    );
                }
            }
            let Some(message) = to_client(message) else {
                continue;
            };
            let closing = matches!(message, AxumMessage::Close(_));
            if client_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
        total
    };

    tokio::select! {
        _ = client_to_upstream => {
            info!("realtime 会话结束(客户端关闭) [{}]: channel_id={}", request_id, info.channel_id);
        }
        usage = upstream_to_client => {
            info!(
                "realtime 会话结束 [{}]: channel_id={}, usage={:?}",
                request_id, info.channel_id, usage
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn usage_is_read_from_response_done() {
        let event = r#"{"type":"response.done","response":{"usage":{"input_tokens":12,"output_tokens":30}}}"#;
        assert_eq!(usage_from_event(event), Some(Usage::new(12, 30)));
        assert_eq!(usage_from_event(r#"{"type":"response.audio.delta"}"#), None);
        assert_eq!(usage_from_event("not json"), None);
    }

    #[test]
    fn close_frames_keep_code_and_reason() {
        let message = to_upstream(AxumMessage::Close(Some(AxumCloseFrame {
            code: 1000,
            reason: "bye".into(),
        })));
        let WsMessage::Close(Some(frame)) = message else {
            panic!("expected close frame");
        };
        assert_eq!(u16::from(frame.code), 1000);
        assert_eq!(frame.reason, "bye");
        assert!(to_client(WsMessage::Text("x".into())).is_some());
    }
}
