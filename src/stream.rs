//! WebSocket 流连接
//!
//! 每个订阅持有一个独立的连接句柄，负责建连、断线重连与拆除，
//! 不理解负载语义。鉴权失败（区分的关闭码 1008）是终态：
//! 不再重连，只向上层发出"会话失效"信号。
//! 其余断开按固定间隔重连（默认 3 秒，无退避；
//! 封顶指数退避是可选改进，见 DESIGN.md）。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 鉴权失败使用的 WebSocket 关闭码（策略违例）
pub const AUTH_FAILED_CLOSE_CODE: u16 = 1008;

/// 默认重连间隔
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// 连接状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closed,
    ReconnectPending,
    /// 终态：凭证被后端拒绝，不会再重连
    AuthFailed,
}

/// 推给订阅方的事件
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    /// 一条已解析的 JSON 负载（格式错误的推送在这之前就被丢弃）
    Message(serde_json::Value),
    Disconnected,
    /// 会话失效信号：上层应清除缓存凭证并要求重新登录
    AuthFailed,
}

/// 单次连接的结束方式
enum CloseOutcome {
    /// 普通断开（网络错误、服务端关闭等），安排重连
    Lost,
    /// 收到鉴权失败关闭码，终止
    AuthRejected,
    /// 手动 reconnect()，立即重试
    ManualReconnect,
    /// close() 被调用
    Cancelled,
}

/// 一个订阅通道的连接句柄
///
/// 连接生命周期归该句柄所有；`close()`（或 drop）同步取消
/// 重连定时器并释放传输资源，不会留下孤儿定时器。
pub struct StreamConnection {
    state_rx: watch::Receiver<ConnState>,
    out_tx: mpsc::UnboundedSender<String>,
    reconnect_notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl StreamConnection {
    /// 建立到 `url` 的订阅连接，返回句柄与事件接收端
    pub fn open(url: String, reconnect_interval: Duration) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnState::Idle);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reconnect_notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task_notify = reconnect_notify.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_loop(url, reconnect_interval, state_tx, out_rx, event_tx, task_notify, task_cancel).await;
        });

        (
            Self {
                state_rx,
                out_tx,
                reconnect_notify,
                cancel,
            },
            event_rx,
        )
    }

    /// 当前连接状态
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// 状态观察通道（用于界面上的连接指示）
    pub fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// 发送一条文本消息。仅在 `Open` 状态下投递，
    /// 否则返回 false：不抛错、不排队，调用方不得假定送达。
    pub fn send(&self, message: String) -> bool {
        if self.state() != ConnState::Open {
            return false;
        }
        self.out_tx.send(message).is_ok()
    }

    /// 手动重连：取消挂起的重连定时器并立即重试
    pub fn reconnect(&self) {
        self.reconnect_notify.notify_one();
    }

    /// 关闭连接，同步取消重连定时器并释放传输资源
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 连接主循环：建连 → 收发 → 按结束方式决定重连或终止
async fn run_loop(
    url: String,
    reconnect_interval: Duration,
    state_tx: watch::Sender<ConnState>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    reconnect_notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        state_tx.send_replace(ConnState::Connecting);
        debug!("正在连接: {}", redact_token(&url));

        let connect_result = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = cancel.cancelled() => {
                state_tx.send_replace(ConnState::Closed);
                return;
            }
        };

        let outcome = match connect_result {
            Ok((ws, _)) => {
                info!("连接成功: {}", redact_token(&url));
                state_tx.send_replace(ConnState::Open);
                let _ = event_tx.send(StreamEvent::Connected);
                drive(ws, &mut out_rx, &event_tx, &reconnect_notify, &cancel).await
            }
            Err(e) => {
                // 建连失败与传输断开同样按普通断开处理，安排重连
                warn!("连接失败: {}", e);
                CloseOutcome::Lost
            }
        };

        match outcome {
            CloseOutcome::Cancelled => {
                state_tx.send_replace(ConnState::Closed);
                return;
            }
            CloseOutcome::AuthRejected => {
                warn!("鉴权失败 (关闭码 {}), 不再重连", AUTH_FAILED_CLOSE_CODE);
                state_tx.send_replace(ConnState::AuthFailed);
                let _ = event_tx.send(StreamEvent::AuthFailed);
                return;
            }
            CloseOutcome::ManualReconnect => {
                state_tx.send_replace(ConnState::Closed);
                let _ = event_tx.send(StreamEvent::Disconnected);
                // 不等待，直接回到 Connecting
                continue;
            }
            CloseOutcome::Lost => {
                state_tx.send_replace(ConnState::Closed);
                let _ = event_tx.send(StreamEvent::Disconnected);
            }
        }

        // 固定间隔重连；手动 reconnect() 会取消定时器立即重试
        state_tx.send_replace(ConnState::ReconnectPending);
        debug!("{:?} 后重连...", reconnect_interval);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_interval) => {}
            _ = reconnect_notify.notified() => {
                info!("手动重连，取消等待");
            }
            _ = cancel.cancelled() => {
                state_tx.send_replace(ConnState::Closed);
                return;
            }
        }
    }
}

/// 驱动一条已建立的连接直到结束
async fn drive(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    reconnect_notify: &Notify,
    cancel: &CancellationToken,
) -> CloseOutcome {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return CloseOutcome::Cancelled;
            }
            _ = reconnect_notify.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return CloseOutcome::ManualReconnect;
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("发送失败: {}", e);
                            return CloseOutcome::Lost;
                        }
                    }
                    // 句柄已被丢弃
                    None => return CloseOutcome::Cancelled,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        // 格式错误的推送：记录并丢弃，不影响后续消息
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(value) => {
                                let _ = event_tx.send(StreamEvent::Message(value));
                            }
                            Err(e) => warn!("消息解析失败: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let auth_rejected = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Policy)
                            .unwrap_or(false);
                        if auth_rejected {
                            return CloseOutcome::AuthRejected;
                        }
                        info!("连接关闭: {:?}", frame.map(|f| u16::from(f.code)));
                        return CloseOutcome::Lost;
                    }
                    Some(Ok(_)) => {
                        // 二进制/Pong 等帧与本协议无关，忽略
                    }
                    Some(Err(e)) => {
                        warn!("读取消息失败: {}", e);
                        return CloseOutcome::Lost;
                    }
                    None => return CloseOutcome::Lost,
                }
            }
        }
    }
}

/// 由面板 HTTP 地址构造推送端点 URL，凭证以查询参数携带
/// （该传输不支持自定义请求头）
pub fn build_ws_url(panel_url: &str, path: &str, token: Option<&str>) -> String {
    let base = panel_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };

    match token {
        Some(token) => format!("{}{}?token={}", ws_base, path, token),
        None => format!("{}{}", ws_base, path),
    }
}

/// 日志里隐藏 URL 中的 token
fn redact_token(url: &str) -> String {
    match url.find("token=") {
        Some(pos) => format!("{}token=***", &url[..pos]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[derive(Clone, Copy)]
    enum ServerMode {
        /// 接受后立刻以 1008 关闭（模拟凭证被拒）
        AuthReject,
        /// 接受后正常关闭（模拟普通断开）
        DropAfterAccept,
    }

    /// 启动一个回环 WebSocket 服务器，返回地址与累计接受次数
    async fn spawn_ws_server(mode: ServerMode) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_count = Arc::new(AtomicUsize::new(0));
        let count = accept_count.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    match mode {
                        ServerMode::AuthReject => {
                            let _ = ws
                                .close(Some(CloseFrame {
                                    code: CloseCode::Policy,
                                    reason: "invalid token".into(),
                                }))
                                .await;
                        }
                        ServerMode::DropAfterAccept => {
                            let _ = ws.close(None).await;
                        }
                    }
                    // 读干净关闭握手
                    while let Some(msg) = ws.next().await {
                        if msg.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, accept_count)
    }

    async fn wait_for_event(
        rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
        want: fn(&StreamEvent) -> bool,
    ) -> StreamEvent {
        timeout(Duration::from_secs(3), async {
            loop {
                let event = rx.recv().await.expect("事件通道被关闭");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("等待事件超时")
    }

    #[tokio::test]
    async fn test_auth_close_is_terminal_no_reconnect() {
        let (addr, accepts) = spawn_ws_server(ServerMode::AuthReject).await;
        let url = format!("ws://{}/ws/dashboard?token=bad", addr);

        let (conn, mut events) = StreamConnection::open(url, Duration::from_millis(100));

        wait_for_event(&mut events, |e| matches!(e, StreamEvent::AuthFailed)).await;
        assert_eq!(conn.state(), ConnState::AuthFailed);
        let mut state = conn.state_watch();
        assert_eq!(*state.borrow_and_update(), ConnState::AuthFailed);

        // 多个重连周期内不得再次建连
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::AuthFailed);
        assert!(!conn.send("{}".to_string()));
    }

    #[tokio::test]
    async fn test_normal_close_schedules_reconnect() {
        let (addr, accepts) = spawn_ws_server(ServerMode::DropAfterAccept).await;
        let url = format!("ws://{}/ws/dashboard", addr);

        let (conn, mut events) = StreamConnection::open(url, Duration::from_millis(100));

        wait_for_event(&mut events, |e| matches!(e, StreamEvent::Disconnected)).await;

        // 固定间隔后自动重连
        timeout(Duration::from_secs(3), async {
            while accepts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("未观察到重连");

        conn.close();
    }

    #[tokio::test]
    async fn test_manual_reconnect_cancels_pending_timer() {
        let (addr, accepts) = spawn_ws_server(ServerMode::DropAfterAccept).await;
        let url = format!("ws://{}/ws/dashboard", addr);

        // 定时器设得很长，只有手动重连才可能在测试时限内二次建连
        let (conn, mut events) = StreamConnection::open(url, Duration::from_secs(30));

        wait_for_event(&mut events, |e| matches!(e, StreamEvent::Disconnected)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        conn.reconnect();
        timeout(Duration::from_secs(2), async {
            while accepts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("手动重连未生效");

        // 没有双重建连：第二次断开后回到 30 秒等待
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 2);

        conn.close();
    }

    #[tokio::test]
    async fn test_close_releases_pending_timer() {
        let (addr, accepts) = spawn_ws_server(ServerMode::DropAfterAccept).await;
        let url = format!("ws://{}/ws/dashboard", addr);

        let (conn, mut events) = StreamConnection::open(url, Duration::from_millis(100));
        wait_for_event(&mut events, |e| matches!(e, StreamEvent::Disconnected)).await;

        // 在重连等待期间关闭：定时器不得再触发建连
        conn.close();
        let before = accepts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_close_during_connect_settles_to_closed() {
        // 只接受 TCP、不回应 WebSocket 握手，让建连悬停在 Connecting
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (conn, _events) =
            StreamConnection::open(format!("ws://{}/ws/dashboard", addr), Duration::from_millis(100));
        let mut state = conn.state_watch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.state(), ConnState::Connecting);

        conn.close();
        timeout(Duration::from_secs(2), async {
            while *state.borrow_and_update() != ConnState::Closed {
                state.changed().await.expect("状态通道被关闭");
            }
        })
        .await
        .expect("关闭后状态未落到 Closed");
    }

    #[test]
    fn test_build_ws_url() {
        assert_eq!(
            build_ws_url("http://panel:8000", "/ws/dashboard", Some("abc")),
            "ws://panel:8000/ws/dashboard?token=abc"
        );
        assert_eq!(
            build_ws_url("https://panel.example.com/", "/ws/logs/c1", Some("t")),
            "wss://panel.example.com/ws/logs/c1?token=t"
        );
        assert_eq!(
            build_ws_url("panel:8000", "/ws/dashboard", None),
            "ws://panel:8000/ws/dashboard"
        );
    }

    #[test]
    fn test_redact_token() {
        assert_eq!(
            redact_token("ws://h/ws/dashboard?token=secret"),
            "ws://h/ws/dashboard?token=***"
        );
    }
}
