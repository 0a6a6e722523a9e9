//! Dashboard 会话
//!
//! 持有唯一一条到 `/ws/dashboard` 的订阅连接，把每次推送与
//! 周期性拉取的注册客户端/Agent 快照送入合并器，
//! 再把派生视图和连接状态以不可变快照的形式发布给订阅方。
//!
//! 任一上游失败只会让对应字段退化，不会中断会话；
//! 唯一向上传播的是鉴权失效：清除缓存凭证并发出强制登出事件。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionEvent;
use crate::api::ApiClient;
use crate::model::{
    AgentHeartbeat, DashboardData, ProxyRuntimeStat, PushEnvelope, RegisteredClient, ServerInfo,
    ServerStatus,
};
use crate::reconcile::{merge, summarize, DerivedClientView, FleetSummary};
use crate::stream::{build_ws_url, StreamConnection, StreamEvent};

/// 发布给展示层的不可变快照（每次合并整体替换，消费方不得修改）
#[derive(Debug, Clone, Default)]
pub struct DashboardSnapshot {
    /// 推送通道当前是否连通（连接指示）
    pub connected: bool,
    pub clients: Vec<DerivedClientView>,
    pub summary: FleetSummary,
    pub server_info: Option<ServerInfo>,
    pub disabled_ports: Vec<u16>,
    /// 最后一次成功合并的时刻；从未收到数据时为 None
    pub last_merge: Option<DateTime<Utc>>,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub online_window_secs: i64,
    pub reconnect_interval: Duration,
    pub poll_interval: Duration,
}

/// 三个独立数据源的最近一次可用值
#[derive(Debug, Default)]
struct Sources {
    registered: Vec<RegisteredClient>,
    /// None = 隧道服务器不可达 / 查询失败
    proxies: Option<Vec<ProxyRuntimeStat>>,
    /// None = Agent 列表查询失败
    heartbeats: Option<Vec<AgentHeartbeat>>,
    /// 最近一次成功的隧道服务器状态（含汇总信息与聚合流量）
    server_status: Option<ServerStatus>,
    disabled_ports: Vec<u16>,
}

/// Dashboard 会话句柄
pub struct DashboardSession {
    cancel: CancellationToken,
}

impl DashboardSession {
    /// 启动会话，返回句柄、快照观察通道与会话事件接收端
    pub fn open(
        api: ApiClient,
        config: DashboardConfig,
    ) -> (
        Self,
        watch::Receiver<DashboardSnapshot>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (snapshot_tx, snapshot_rx) = watch::channel(DashboardSnapshot::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_session(api, config, snapshot_tx, event_tx, task_cancel).await;
        });

        (Self { cancel }, snapshot_rx, event_rx)
    }

    /// 关闭会话：取消订阅连接与轮询
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(
    api: ApiClient,
    config: DashboardConfig,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let url = build_ws_url(api.base_url(), "/ws/dashboard", api.token().as_deref());
    let (conn, mut events) = StreamConnection::open(url, config.reconnect_interval);

    let mut sources = Sources::default();
    let mut connected = false;

    // 首个 tick 立即触发，作为初始拉取
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.close();
                return;
            }
            event = events.recv() => {
                match event {
                    Some(StreamEvent::Connected) => {
                        connected = true;
                        publish(&snapshot_tx, &sources, connected, &config);
                    }
                    Some(StreamEvent::Disconnected) => {
                        connected = false;
                        publish(&snapshot_tx, &sources, connected, &config);
                    }
                    Some(StreamEvent::Message(value)) => {
                        if apply_push(&mut sources, value) {
                            publish(&snapshot_tx, &sources, connected, &config);
                        }
                    }
                    Some(StreamEvent::AuthFailed) => {
                        // 鉴权失效：清凭证、通知上层强制重新登录，会话终止
                        warn!("推送通道鉴权失效，清除缓存凭证");
                        api.clear_token();
                        connected = false;
                        publish(&snapshot_tx, &sources, connected, &config);
                        let _ = event_tx.send(SessionEvent::ForceLogout);
                        conn.close();
                        return;
                    }
                    None => return,
                }
            }
            _ = poll.tick() => {
                poll_sources(&api, &mut sources).await;
                publish(&snapshot_tx, &sources, connected, &config);
            }
        }
    }
}

/// 处理一条推送；返回是否需要重新合并发布
fn apply_push(sources: &mut Sources, value: serde_json::Value) -> bool {
    let envelope: PushEnvelope = match serde_json::from_value(value) {
        Ok(env) => env,
        Err(e) => {
            warn!("推送信封解析失败: {}", e);
            return false;
        }
    };

    // 未识别的 type 忽略，不是错误
    if envelope.kind != "dashboard" {
        debug!("忽略推送类型: {}", envelope.kind);
        return false;
    }

    let data: DashboardData = match serde_json::from_value(envelope.data) {
        Ok(data) => data,
        Err(e) => {
            warn!("Dashboard 负载解析失败: {}", e);
            return false;
        }
    };

    sources.registered = data.registered_clients;
    sources.heartbeats = Some(data.agents);
    sources.disabled_ports = data.disabled_ports;

    match data.status {
        Some(mut status) if status.success => {
            // 状态成功但未带代理列表时按空列表处理（查询成功、无数据）
            sources.proxies = Some(status.proxies.take().unwrap_or_default());
            sources.server_status = Some(status);
        }
        _ => {
            // 隧道服务器不可达：代理源整体退化为未知
            sources.proxies = None;
        }
    }

    true
}

/// 周期性拉取三个 REST 协作方，各自独立吸收失败
async fn poll_sources(api: &ApiClient, sources: &mut Sources) {
    match api.fetch_clients().await {
        Ok(clients) => sources.registered = clients,
        // 注册列表拉取失败：保留上一次的已知值
        Err(e) => warn!("拉取客户端列表失败: {}", e),
    }

    match api.fetch_agents().await {
        Ok(agents) => sources.heartbeats = Some(agents),
        Err(e) => {
            warn!("拉取 Agent 列表失败: {}", e);
            sources.heartbeats = None;
        }
    }

    match api.fetch_server_status().await {
        Ok(mut status) if status.success => {
            sources.proxies = Some(status.proxies.take().unwrap_or_default());
            sources.server_status = Some(status);
        }
        Ok(_) => sources.proxies = None,
        Err(e) => {
            warn!("拉取隧道服务器状态失败: {}", e);
            sources.proxies = None;
        }
    }

    match api.fetch_disabled_ports().await {
        Ok(ports) => sources.disabled_ports = ports,
        Err(e) => debug!("拉取禁用端口失败: {}", e),
    }
}

/// 重新合并并整体替换快照
fn publish(
    snapshot_tx: &watch::Sender<DashboardSnapshot>,
    sources: &Sources,
    connected: bool,
    config: &DashboardConfig,
) {
    // 在线判定统一使用合并调用时刻，避免各数据源时钟偏差
    let now = Utc::now();
    let clients = merge(
        &sources.registered,
        sources.proxies.as_deref(),
        sources.heartbeats.as_deref(),
        now.timestamp(),
        config.online_window_secs,
    );
    let summary = summarize(&clients, sources.server_status.as_ref());

    snapshot_tx.send_replace(DashboardSnapshot {
        connected,
        clients,
        summary,
        server_info: sources
            .server_status
            .as_ref()
            .and_then(|s| s.server_info.clone()),
        disabled_ports: sources.disabled_ports.clone(),
        last_merge: Some(now),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_push_dashboard_updates_sources() {
        let mut sources = Sources::default();
        let value = json!({
            "type": "dashboard",
            "data": {
                "status": {
                    "success": true,
                    "server_info": {"clientCounts": 2},
                    "proxies": [{"name": "box1.ssh", "today_traffic_in": 7}],
                    "aggregated_traffic_in": 77
                },
                "registered_clients": [{"id": "a", "name": "box1"}],
                "agents": [{"client_id": "a", "is_online": true}],
                "disabled_ports": [6022]
            }
        });

        assert!(apply_push(&mut sources, value));
        assert_eq!(sources.registered.len(), 1);
        assert_eq!(sources.heartbeats.as_ref().unwrap().len(), 1);
        assert_eq!(sources.proxies.as_ref().unwrap()[0].today_traffic_in, 7);
        assert_eq!(sources.disabled_ports, vec![6022]);

        let status = sources.server_status.as_ref().unwrap();
        assert_eq!(status.server_info.as_ref().unwrap().client_counts, Some(2));
        assert_eq!(status.aggregated_traffic_in, Some(77));
        // 代理列表已移入独立的数据源字段
        assert!(status.proxies.is_none());
    }

    #[test]
    fn test_apply_push_failed_status_degrades_proxies_only() {
        let mut sources = Sources::default();
        let value = json!({
            "type": "dashboard",
            "data": {
                "status": {"success": false, "message": "frps unreachable"},
                "registered_clients": [{"id": "a", "name": "box1"}],
                "agents": []
            }
        });

        assert!(apply_push(&mut sources, value));
        // 代理源退化为未知，客户端列表照常更新，上次的服务器状态保留
        assert!(sources.proxies.is_none());
        assert!(sources.server_status.is_none());
        assert_eq!(sources.registered.len(), 1);
        assert!(sources.heartbeats.is_some());
    }

    #[test]
    fn test_apply_push_ignores_unknown_type() {
        let mut sources = Sources::default();
        let value = json!({"type": "metrics_v2", "data": {"whatever": 1}});
        assert!(!apply_push(&mut sources, value));
        assert!(sources.registered.is_empty());
    }

    #[test]
    fn test_apply_push_malformed_payload_dropped() {
        let mut sources = Sources::default();
        // data 不是对象：解析失败应被吸收，不影响已有状态
        sources.disabled_ports = vec![1];
        let value = json!({"type": "dashboard", "data": "not an object"});
        assert!(!apply_push(&mut sources, value));
        assert_eq!(sources.disabled_ports, vec![1]);
    }
}
