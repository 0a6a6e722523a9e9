//! 日志会话
//!
//! 为每个正在查看日志的客户端维护一条独立的订阅连接，
//! 把推送的日志事件写入该客户端的缓冲区。
//! 根据当前展示的客户端集合调和连接：先关掉不再查看的，
//! 再为新增的建连，并发连接数因此不会超过打开的日志面板数。
//!
//! 任一日志流上的鉴权失效与 Dashboard 通道同等对待：
//! 清除缓存凭证并向上层发出强制登出事件。

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SessionEvent;
use crate::api::ApiClient;
use crate::logbuf::{LogBuffer, LogEntry};
use crate::model::PushEnvelope;
use crate::stream::{build_ws_url, StreamConnection, StreamEvent};

/// 单个客户端的日志视图：一条连接 + 一个缓冲区
struct LogView {
    conn: StreamConnection,
    buffer: LogBuffer,
}

/// 日志会话管理器
pub struct LogSession {
    api: ApiClient,
    reconnect_interval: Duration,
    capacity: usize,
    views: HashMap<String, LogView>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LogSession {
    pub fn new(
        api: ApiClient,
        reconnect_interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                api,
                reconnect_interval,
                capacity,
                views: HashMap::new(),
                event_tx,
            },
            event_rx,
        )
    }

    /// 按当前展示的客户端集合调和连接状态。
    /// 先关闭不再查看的客户端的连接，再为新增客户端建连。
    pub fn set_active(&mut self, client_ids: &[String]) {
        let to_close: Vec<String> = self
            .views
            .keys()
            .filter(|id| !client_ids.contains(*id))
            .cloned()
            .collect();

        for id in to_close {
            self.close_view(&id);
        }

        for id in client_ids {
            if !self.views.contains_key(id) {
                self.open_view(id);
            }
        }
    }

    /// 当前有订阅的客户端
    pub fn active_ids(&self) -> Vec<String> {
        self.views.keys().cloned().collect()
    }

    /// 某客户端的日志缓冲区（句柄可克隆给展示层）
    pub fn buffer(&self, client_id: &str) -> Option<LogBuffer> {
        self.views.get(client_id).map(|v| v.buffer.clone())
    }

    /// 该客户端的日志流是否连通（LIVE / OFFLINE 指示）
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.views
            .get(client_id)
            .map(|v| v.conn.is_open())
            .unwrap_or(false)
    }

    /// 手动重连某客户端的日志流
    pub fn reconnect(&self, client_id: &str) {
        if let Some(view) = self.views.get(client_id) {
            view.conn.reconnect();
        }
    }

    fn open_view(&mut self, client_id: &str) {
        info!("打开日志流: {}", client_id);
        let token = self.api.token();
        let url = build_ws_url(
            self.api.base_url(),
            &format!("/ws/logs/{}", client_id),
            token.as_deref(),
        );
        let (conn, events) = StreamConnection::open(url, self.reconnect_interval);
        let buffer = LogBuffer::new(self.capacity);

        tokio::spawn(route_events(
            client_id.to_string(),
            events,
            buffer.clone(),
            self.api.clone(),
            self.event_tx.clone(),
        ));

        self.views.insert(
            client_id.to_string(),
            LogView { conn, buffer },
        );
    }

    fn close_view(&mut self, client_id: &str) {
        if let Some(view) = self.views.remove(client_id) {
            info!("关闭日志流: {}", client_id);
            view.conn.close();
        }
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        for view in self.views.values() {
            view.conn.close();
        }
    }
}

/// 把一条连接上的日志事件路由进缓冲区；连接关闭后自然退出
async fn route_events(
    client_id: String,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    buffer: LogBuffer,
    api: ApiClient,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Message(value) => {
                let envelope: PushEnvelope = match serde_json::from_value(value) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!("日志推送解析失败 ({}): {}", client_id, e);
                        continue;
                    }
                };
                match envelope.kind.as_str() {
                    "log" | "info" => {
                        let text = envelope
                            .data
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| envelope.data.to_string());
                        buffer.push(LogEntry {
                            timestamp: Utc::now(),
                            text,
                            client_id: envelope.client_id.or_else(|| Some(client_id.clone())),
                        });
                    }
                    other => debug!("忽略日志流消息类型: {}", other),
                }
            }
            StreamEvent::Connected => debug!("日志流已连接: {}", client_id),
            StreamEvent::Disconnected => debug!("日志流已断开: {}", client_id),
            StreamEvent::AuthFailed => {
                // 凭证失效：清凭证、通知上层强制重新登录；
                // 缓冲区中已有的日志保留可见
                warn!("日志流鉴权失效 ({}), 清除缓存凭证", client_id);
                api.clear_token();
                let _ = event_tx.send(SessionEvent::ForceLogout);
                return;
            }
        }
    }
}
