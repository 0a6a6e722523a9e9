//! 状态合并器
//!
//! 将三个可独立失败的数据源（持久化客户端配置、运行时代理统计、Agent 心跳）
//! 合并为每个客户端的派生视图。纯函数，无 I/O，无隐藏状态；
//! 任何一个临时数据源缺失只会让对应字段退化为"未知"，
//! 绝不会丢掉已注册的客户端。

use std::collections::HashMap;

use tracing::warn;

use crate::model::{
    composite_name, AgentHeartbeat, ProxyRuntimeStat, RegisteredClient, ServerStatus,
};

/// 在线判定窗口的默认值（秒）
///
/// 所有调用点共用这一个阈值，并通过配置项显式暴露，
/// 不允许不同界面各用各的窗口。
pub const DEFAULT_ONLINE_WINDOW_SECS: i64 = 90;

/// 单条隧道的运行时流量（匹配到代理记录时才存在）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTraffic {
    pub today_in: u64,
    pub today_out: u64,
    pub cur_conns: u64,
}

/// 派生视图中的一行隧道：配置 × 运行时统计
#[derive(Debug, Clone)]
pub struct DerivedTunnelRow {
    pub id: i64,
    pub name: String,
    /// 用于关联运行时记录的复合名 `{client}.{tunnel}`
    pub composite_name: String,
    pub tunnel_type: crate::model::TunnelType,
    pub remote_port: Option<u16>,
    pub enabled: bool,
    /// None 表示"当前无运行时可见性"，与 0 字节流量是两回事
    pub traffic: Option<TunnelTraffic>,
}

/// 每客户端派生视图（每次合并从头重算，从不持久化）
#[derive(Debug, Clone)]
pub struct DerivedClientView {
    pub id: String,
    pub name: String,
    pub online: bool,
    /// 该客户端的 Agent 是否在线（没有心跳记录时为 false）
    pub agent_online: bool,
    /// Agent 未上报时为 None（界面显示 "unknown"）
    pub os: Option<String>,
    pub arch: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub net_speed_in: Option<u64>,
    pub net_speed_out: Option<u64>,
    pub tunnels: Vec<DerivedTunnelRow>,
    /// 会话级流量：匹配到的运行时统计之和；代理源整体不可用时为 None
    pub session_traffic_in: Option<u64>,
    pub session_traffic_out: Option<u64>,
    pub cur_conns: Option<u64>,
    /// 机器级累计流量，来自心跳或注册记录，与运行时可见性无关
    pub machine_traffic_in: u64,
    pub machine_traffic_out: u64,
    /// 配置的隧道总数（无论运行时是否可见）
    pub configured_tunnels: usize,
    /// 运行时可见（匹配到代理记录）的隧道数
    pub active_tunnels: usize,
}

/// 全舰队汇总（界面顶部统计卡）
#[derive(Debug, Clone, Default)]
pub struct FleetSummary {
    pub total_clients: u64,
    pub online_clients: u64,
    pub online_agents: u64,
    pub configured_tunnels: u64,
    pub active_tunnels: u64,
    pub session_traffic_in: Option<u64>,
    pub session_traffic_out: Option<u64>,
    pub machine_traffic_in: u64,
    pub machine_traffic_out: u64,
    /// 隧道服务器侧上报的累计流量：状态级聚合值优先，
    /// 缺失时回退 server_info 的累计计数，都没有则未知
    pub server_traffic_in: Option<u64>,
    pub server_traffic_out: Option<u64>,
}

/// 合并三个数据源为派生视图列表
///
/// - `proxies` / `heartbeats` 为 None 表示对应上游查询失败，
///   相关字段退化为未知，客户端列表本身仍完整输出。
/// - `now` 使用合并调用时刻的时间戳，避免各数据源独立打点造成的时钟偏差。
/// - 输出对相同输入完全确定，顺序与 `registered` 一致。
pub fn merge(
    registered: &[RegisteredClient],
    proxies: Option<&[ProxyRuntimeStat]>,
    heartbeats: Option<&[AgentHeartbeat]>,
    now: i64,
    online_window: i64,
) -> Vec<DerivedClientView> {
    // 两个索引各建一次，避免逐客户端线性扫描
    let proxy_index: Option<HashMap<&str, &ProxyRuntimeStat>> = proxies.map(|list| {
        let mut index = HashMap::with_capacity(list.len());
        for p in list {
            if let Some(prev) = index.insert(p.name.as_str(), p) {
                // 复合名冲突：不同客户端拼出了相同的 {client}.{tunnel}。
                // 后写入者生效，这里显式告警而不是无声合并。
                warn!(
                    "运行时代理复合名冲突: {} (冲突记录 today_in={} / today_in={})",
                    p.name, prev.today_traffic_in, p.today_traffic_in
                );
            }
        }
        index
    });

    let heartbeat_index: HashMap<&str, &AgentHeartbeat> = heartbeats
        .unwrap_or(&[])
        .iter()
        .map(|h| (h.client_id.as_str(), h))
        .collect();

    registered
        .iter()
        .map(|client| derive_client(client, proxy_index.as_ref(), &heartbeat_index, now, online_window))
        .collect()
}

fn derive_client(
    client: &RegisteredClient,
    proxy_index: Option<&HashMap<&str, &ProxyRuntimeStat>>,
    heartbeat_index: &HashMap<&str, &AgentHeartbeat>,
    now: i64,
    online_window: i64,
) -> DerivedClientView {
    let heartbeat = heartbeat_index.get(client.id.as_str()).copied();

    // 在线判定优先级：有心跳则以 is_online 为准，
    // 否则回退到 last_seen 是否落在窗口内
    let online = match heartbeat {
        Some(h) => h.is_online,
        None => client
            .last_seen
            .map(|seen| now - seen < online_window)
            .unwrap_or(false),
    };

    let mut tunnels = Vec::with_capacity(client.tunnels.len());
    let mut session_in: u64 = 0;
    let mut session_out: u64 = 0;
    let mut conns: u64 = 0;
    let mut active = 0usize;

    for tunnel in &client.tunnels {
        let key = composite_name(&client.name, &tunnel.name);
        // 代理源可用时才做关联；缺失条目表示"无运行时可见性"而非 0
        let traffic = proxy_index
            .and_then(|index| index.get(key.as_str()))
            .map(|p| TunnelTraffic {
                today_in: p.today_traffic_in,
                today_out: p.today_traffic_out,
                cur_conns: p.cur_conns,
            });

        if let Some(t) = traffic {
            session_in += t.today_in;
            session_out += t.today_out;
            conns += t.cur_conns;
            active += 1;
        }

        tunnels.push(DerivedTunnelRow {
            id: tunnel.id,
            name: tunnel.name.clone(),
            composite_name: key,
            tunnel_type: tunnel.tunnel_type,
            remote_port: tunnel.remote_port,
            enabled: tunnel.enabled,
            traffic,
        });
    }

    // 机器级累计流量：优先心跳上报值，否则用注册记录里的持久化计数器
    let machine_in = heartbeat
        .and_then(|h| h.net_bytes_in)
        .unwrap_or(client.net_bytes_in);
    let machine_out = heartbeat
        .and_then(|h| h.net_bytes_out)
        .unwrap_or(client.net_bytes_out);

    let proxies_available = proxy_index.is_some();

    DerivedClientView {
        id: client.id.clone(),
        name: client.name.clone(),
        online,
        agent_online: heartbeat.map(|h| h.is_online).unwrap_or(false),
        os: heartbeat.and_then(|h| h.os.clone()),
        arch: heartbeat.and_then(|h| h.arch.clone()),
        cpu_percent: heartbeat.and_then(|h| h.cpu_percent),
        memory_percent: heartbeat.and_then(|h| h.memory_percent),
        disk_percent: heartbeat.and_then(|h| h.disk_percent),
        net_speed_in: heartbeat.and_then(|h| h.net_speed_in),
        net_speed_out: heartbeat.and_then(|h| h.net_speed_out),
        configured_tunnels: client.tunnels.len(),
        active_tunnels: active,
        tunnels,
        session_traffic_in: proxies_available.then_some(session_in),
        session_traffic_out: proxies_available.then_some(session_out),
        cur_conns: proxies_available.then_some(conns),
        machine_traffic_in: machine_in,
        machine_traffic_out: machine_out,
    }
}

/// 基于派生视图计算全舰队汇总
pub fn summarize(views: &[DerivedClientView], status: Option<&ServerStatus>) -> FleetSummary {
    let mut summary = FleetSummary::default();

    for view in views {
        if view.online {
            summary.online_clients += 1;
        }
        if view.agent_online {
            summary.online_agents += 1;
        }
        summary.configured_tunnels += view.configured_tunnels as u64;
        summary.active_tunnels += view.active_tunnels as u64;
        summary.machine_traffic_in += view.machine_traffic_in;
        summary.machine_traffic_out += view.machine_traffic_out;

        if let Some(v) = view.session_traffic_in {
            *summary.session_traffic_in.get_or_insert(0) += v;
        }
        if let Some(v) = view.session_traffic_out {
            *summary.session_traffic_out.get_or_insert(0) += v;
        }
    }

    // 隧道服务器上报的连接数为 0 时回退到注册数
    let reported = status
        .and_then(|s| s.server_info.as_ref())
        .and_then(|i| i.client_counts)
        .unwrap_or(0);
    summary.total_clients = reported.max(views.len() as u64);

    summary.server_traffic_in = status.and_then(|s| {
        s.aggregated_traffic_in
            .or_else(|| s.server_info.as_ref().and_then(|i| i.total_traffic_in))
    });
    summary.server_traffic_out = status.and_then(|s| {
        s.aggregated_traffic_out
            .or_else(|| s.server_info.as_ref().and_then(|i| i.total_traffic_out))
    });

    // 运行时代理列表不可见时回退到服务器上报的代理总数
    if summary.active_tunnels == 0 {
        if let Some(total) = status.and_then(|s| s.total_proxies) {
            summary.active_tunnels = total;
        }
    }

    summary
}
