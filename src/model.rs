//! 数据模型
//!
//! 定义面板后端推送/返回的三类独立数据源：
//! 持久化的客户端与隧道配置、隧道服务器的运行时代理统计、Agent 心跳，
//! 以及 WebSocket 推送信封。

use serde::{Deserialize, Serialize};

/// 隧道协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Udp,
    Http,
    Https,
}

impl TunnelType {
    /// tcp/udp 需要 remote_port，http/https 需要 custom_domains
    pub fn requires_remote_port(&self) -> bool {
        matches!(self, TunnelType::Tcp | TunnelType::Udp)
    }
}

/// 隧道配置（持久化，由 CRUD 协作方维护，本核心只读）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    pub local_port: u16,
    /// tcp/udp 必填
    #[serde(default)]
    pub remote_port: Option<u16>,
    /// http/https 必填，逗号分隔域名列表
    #[serde(default)]
    pub custom_domains: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// 已注册的隧道客户端（持久化身份）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    /// 不透明稳定 ID
    pub id: String,
    pub name: String,
    /// 客户端自身心跳通道更新的最后活跃时间（epoch 秒），与 Agent 无关
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    /// 机器级累计流量计数器，单调不减，仅 Agent 重装时清零
    #[serde(default)]
    pub net_bytes_in: u64,
    #[serde(default)]
    pub net_bytes_out: u64,
}

/// 运行时代理统计（仅隧道服务器可达时存在）
///
/// 以复合名 `{client.name}.{tunnel.name}` 为键。上游存在 snake_case 与
/// camelCase 两种字段命名，通过 serde alias 在入口处统一归一化为
/// 内部唯一模式，派生逻辑不再做兜底查找。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRuntimeStat {
    pub name: String,
    /// 今日入站流量（按隧道服务器本地日界清零，与机器级计数器不同步）
    #[serde(default, alias = "todayTrafficIn")]
    pub today_traffic_in: u64,
    #[serde(default, alias = "todayTrafficOut")]
    pub today_traffic_out: u64,
    #[serde(default, alias = "curConns")]
    pub cur_conns: u64,
}

/// Agent 心跳（以 client_id 为键；并非所有客户端都装有 Agent）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub client_id: String,
    /// 存在心跳时，在线状态以此字段为准
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    /// 瞬时网络速率（字节/秒）
    #[serde(default)]
    pub net_speed_in: Option<u64>,
    #[serde(default)]
    pub net_speed_out: Option<u64>,
    /// 机器级累计流量（与 RegisteredClient 的计数器同源）
    #[serde(default)]
    pub net_bytes_in: Option<u64>,
    #[serde(default)]
    pub net_bytes_out: Option<u64>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
}

/// 隧道服务器自身的汇总信息（字段命名来自其原生 API，camelCase）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default, alias = "clientCounts")]
    pub client_counts: Option<u64>,
    #[serde(default, alias = "totalTrafficIn")]
    pub total_traffic_in: Option<u64>,
    #[serde(default, alias = "totalTrafficOut")]
    pub total_traffic_out: Option<u64>,
}

/// 隧道服务器状态查询结果（可独立失败）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub proxies: Option<Vec<ProxyRuntimeStat>>,
    #[serde(default)]
    pub total_proxies: Option<u64>,
    #[serde(default)]
    pub aggregated_traffic_in: Option<u64>,
    #[serde(default)]
    pub aggregated_traffic_out: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Dashboard 推送负载：`{type: "dashboard", data: {...}}` 中的 data 部分
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardData {
    #[serde(default)]
    pub status: Option<ServerStatus>,
    #[serde(default)]
    pub registered_clients: Vec<RegisteredClient>,
    #[serde(default)]
    pub agents: Vec<AgentHeartbeat>,
    #[serde(default)]
    pub disabled_ports: Vec<u16>,
}

/// WebSocket 推送信封
///
/// 已识别的 type：`dashboard`（状态推送）、`log` / `info`（日志流）。
/// 未识别的 type 直接忽略，不视为错误。
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// 新建隧道请求（变更后核心只需触发一次重新拉取/合并）
#[derive(Debug, Clone, Serialize)]
pub struct TunnelCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub custom_domains: Option<String>,
}

/// 复合名：配置隧道与运行时代理记录之间唯一的关联键
pub fn composite_name(client_name: &str, tunnel_name: &str) -> String {
    format!("{}.{}", client_name, tunnel_name)
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_stat_field_aliases() {
        // snake_case 与 camelCase 两种上游命名都归一化到同一内部模式
        let snake: ProxyRuntimeStat = serde_json::from_str(
            r#"{"name":"box1.ssh","today_traffic_in":500,"today_traffic_out":600,"cur_conns":2}"#,
        )
        .unwrap();
        assert_eq!(snake.today_traffic_in, 500);
        assert_eq!(snake.cur_conns, 2);

        let camel: ProxyRuntimeStat = serde_json::from_str(
            r#"{"name":"box1.ssh","todayTrafficIn":500,"todayTrafficOut":600,"curConns":2}"#,
        )
        .unwrap();
        assert_eq!(camel.today_traffic_in, 500);
        assert_eq!(camel.today_traffic_out, 600);
        assert_eq!(camel.cur_conns, 2);
    }

    #[test]
    fn test_envelope_unknown_type_still_parses() {
        let env: PushEnvelope =
            serde_json::from_str(r#"{"type":"something_new","data":{"x":1}}"#).unwrap();
        assert_eq!(env.kind, "something_new");
        assert!(env.client_id.is_none());
    }

    #[test]
    fn test_registered_client_minimal_fields() {
        // 旧版客户端可能只有 id/name/last_seen
        let c: RegisteredClient =
            serde_json::from_str(r#"{"id":"a","name":"box1","last_seen":1700000000}"#).unwrap();
        assert_eq!(c.tunnels.len(), 0);
        assert_eq!(c.net_bytes_in, 0);
    }

    #[test]
    fn test_tunnel_type_requirements() {
        assert!(TunnelType::Tcp.requires_remote_port());
        assert!(TunnelType::Udp.requires_remote_port());
        assert!(!TunnelType::Http.requires_remote_port());
        assert!(!TunnelType::Https.requires_remote_port());
    }
}
