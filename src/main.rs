mod api;
mod config;
mod logbuf;
mod model;
mod reconcile;
mod session;
mod stream;

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::ApiClient;
use config::Config;
use model::{TunnelCreate, TunnelType};
use session::dashboard::DashboardConfig;
use session::{DashboardSession, DashboardSnapshot, LogSession, SessionEvent};

#[derive(Parser)]
#[command(name = "frp-console", version, about = "FRP Console - 反向隧道舰队操作台")]
struct Cli {
    /// 配置文件路径（默认尝试 frp-console.toml）
    #[arg(long, global = true)]
    config: Option<String>,

    /// 面板地址（覆盖配置文件，例如 http://panel:8000）
    #[arg(long, global = true)]
    panel_url: Option<String>,

    /// Bearer Token（覆盖配置文件）
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 订阅 Dashboard 推送通道，持续输出合并后的舰队视图
    Dashboard,
    /// 实时查看指定客户端的日志流
    Logs {
        /// 客户端 ID
        client_id: String,

        /// 展示期过滤：大小写不敏感的子串匹配（不影响缓冲与导出）
        #[arg(long)]
        filter: Option<String>,

        /// 退出时把完整缓冲区（无视过滤）导出到该文件
        #[arg(long)]
        export: Option<String>,
    },
    /// 用户名密码登录，换取并打印 Token
    Login {
        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,
    },
    /// 隧道变更（生效结果在下一个轮询/推送周期反映到视图）
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
}

#[derive(Subcommand)]
enum TunnelAction {
    /// 新建隧道
    Create {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        name: String,

        /// 隧道类型：tcp / udp / http / https
        #[arg(long = "type", default_value = "tcp")]
        tunnel_type: String,

        #[arg(long, default_value = "127.0.0.1")]
        local_ip: String,

        #[arg(long)]
        local_port: u16,

        /// tcp/udp 必填
        #[arg(long)]
        remote_port: Option<u16>,

        /// http/https 必填，逗号分隔域名列表
        #[arg(long)]
        custom_domains: Option<String>,
    },
    /// 启用隧道
    Enable {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        tunnel_id: i64,
    },
    /// 禁用隧道
    Disable {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        tunnel_id: i64,
    },
    /// 删除隧道
    Delete {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        tunnel_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化 tracing 日志系统
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Dashboard => run_dashboard(cfg).await?,
        Commands::Logs {
            client_id,
            filter,
            export,
        } => run_logs(cfg, client_id, filter, export).await?,
        Commands::Login { username, password } => run_login(cfg, username, password).await?,
        Commands::Tunnel { action } => run_tunnel(cfg, action).await?,
    }

    Ok(())
}

/// 读取配置文件（显式指定则必须存在），再套用命令行覆盖
fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(url) = &cli.panel_url {
        cfg.panel_url = url.clone();
    }
    if let Some(token) = &cli.token {
        cfg.token = Some(token.clone());
    }

    if cfg.panel_url.is_empty() {
        bail!("缺少面板地址：请在配置文件中设置 panel_url 或使用 --panel-url");
    }

    Ok(cfg)
}

async fn run_dashboard(cfg: Config) -> Result<()> {
    info!("🌐 面板地址: {}", cfg.panel_url);

    let api = ApiClient::new(&cfg.panel_url, cfg.token.clone());
    let (session, mut snapshots, mut events) = DashboardSession::open(
        api,
        DashboardConfig {
            online_window_secs: cfg.online_window_secs,
            reconnect_interval: cfg.reconnect_interval(),
            poll_interval: cfg.poll_interval(),
        },
    );

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            event = events.recv() => {
                if let Some(SessionEvent::ForceLogout) = event {
                    session.close();
                    bail!("凭证已失效，请重新登录（frp-console login）");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号，关闭会话");
                session.close();
                break;
            }
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &DashboardSnapshot) {
    let s = &snapshot.summary;
    let indicator = if snapshot.connected { "LIVE" } else { "OFFLINE" };

    info!(
        "[{}] 客户端 {}/{} 在线 | Agent {} 在线 | 隧道 {}/{} 活跃 | 会话流量 in {} out {} | 服务器累计 in {} out {}",
        indicator,
        s.online_clients,
        s.total_clients,
        s.online_agents,
        s.active_tunnels,
        s.configured_tunnels,
        fmt_opt_bytes(s.session_traffic_in),
        fmt_opt_bytes(s.session_traffic_out),
        fmt_opt_bytes(s.server_traffic_in),
        fmt_opt_bytes(s.server_traffic_out),
    );

    for client in &snapshot.clients {
        info!(
            "  {} [{}] 隧道 {}/{} | 会话 in {} out {} | 机器累计 in {} out {} | CPU {} 内存 {}",
            client.name,
            if client.online { "在线" } else { "离线" },
            client.active_tunnels,
            client.configured_tunnels,
            fmt_opt_bytes(client.session_traffic_in),
            fmt_opt_bytes(client.session_traffic_out),
            format_bytes(client.machine_traffic_in),
            format_bytes(client.machine_traffic_out),
            fmt_opt_percent(client.cpu_percent),
            fmt_opt_percent(client.memory_percent),
        );
    }
}

async fn run_logs(
    cfg: Config,
    client_id: String,
    filter: Option<String>,
    export: Option<String>,
) -> Result<()> {
    let api = ApiClient::new(&cfg.panel_url, cfg.token.clone());
    let (mut session, mut events) =
        LogSession::new(api, cfg.reconnect_interval(), cfg.log_capacity);
    session.set_active(&[client_id.clone()]);

    let buffer = match session.buffer(&client_id) {
        Some(buffer) => buffer,
        None => bail!("日志视图未能打开: {}", client_id),
    };
    let filter_lower = filter.map(|f| f.to_lowercase());

    let mut seen: u64 = 0;
    let mut was_connected = false;
    let mut tick = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let connected = session.is_connected(&client_id);
                if connected != was_connected {
                    info!("日志流状态: {}", if connected { "LIVE" } else { "OFFLINE" });
                    was_connected = connected;
                }

                let total = buffer.total_pushed();
                if total > seen {
                    let entries = buffer.snapshot();
                    let fresh = (total - seen) as usize;
                    let start = entries.len().saturating_sub(fresh);
                    for entry in &entries[start..] {
                        if let Some(f) = &filter_lower {
                            if !entry.text.to_lowercase().contains(f) {
                                continue;
                            }
                        }
                        println!("[{}] {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"), entry.text);
                    }
                    seen = total;
                }
            }
            event = events.recv() => {
                if let Some(SessionEvent::ForceLogout) = event {
                    bail!("凭证已失效，请重新登录（frp-console login）");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    if let Some(path) = export {
        match std::fs::write(&path, buffer.export_text()) {
            Ok(()) => info!("日志已导出到 {}", path),
            Err(e) => warn!("导出日志失败 ({}): {}", path, e),
        }
    }

    Ok(())
}

async fn run_login(cfg: Config, username: String, password: String) -> Result<()> {
    let api = ApiClient::new(&cfg.panel_url, None);
    let token = api.login(&username, &password).await?;
    info!("✅ 登录成功");
    println!("{}", token);
    Ok(())
}

async fn run_tunnel(cfg: Config, action: TunnelAction) -> Result<()> {
    let api = ApiClient::new(&cfg.panel_url, cfg.token.clone());

    match action {
        TunnelAction::Create {
            client_id,
            name,
            tunnel_type,
            local_ip,
            local_port,
            remote_port,
            custom_domains,
        } => {
            let tunnel_type = parse_tunnel_type(&tunnel_type)?;
            if tunnel_type.requires_remote_port() && remote_port.is_none() {
                bail!("tcp/udp 类型的隧道需要 --remote-port");
            }
            if !tunnel_type.requires_remote_port() && custom_domains.is_none() {
                bail!("http/https 类型的隧道需要 --custom-domains");
            }

            let created = api
                .create_tunnel(
                    &client_id,
                    &TunnelCreate {
                        name,
                        tunnel_type,
                        local_ip,
                        local_port,
                        remote_port,
                        custom_domains,
                    },
                )
                .await?;
            info!("✅ 隧道已创建: {} (id={})", created.name, created.id);
        }
        TunnelAction::Enable { client_id, tunnel_id } => {
            api.set_tunnel_enabled(&client_id, tunnel_id, true).await?;
            info!("✅ 隧道已启用: {}", tunnel_id);
        }
        TunnelAction::Disable { client_id, tunnel_id } => {
            api.set_tunnel_enabled(&client_id, tunnel_id, false).await?;
            info!("✅ 隧道已禁用: {}", tunnel_id);
        }
        TunnelAction::Delete { client_id, tunnel_id } => {
            api.delete_tunnel(&client_id, tunnel_id).await?;
            info!("✅ 隧道已删除: {}", tunnel_id);
        }
    }

    Ok(())
}

fn parse_tunnel_type(s: &str) -> Result<TunnelType> {
    match s {
        "tcp" => Ok(TunnelType::Tcp),
        "udp" => Ok(TunnelType::Udp),
        "http" => Ok(TunnelType::Http),
        "https" => Ok(TunnelType::Https),
        other => bail!("未知隧道类型: {} (支持 tcp/udp/http/https)", other),
    }
}

const BYTE_UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// 人类可读的字节数（1024 进制）
fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, BYTE_UNITS[unit])
    }
}

/// 数据源不可用时显示“无数据”，而不是假装为 0
fn fmt_opt_bytes(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => format_bytes(b),
        None => "无数据".to_string(),
    }
}

fn fmt_opt_percent(percent: Option<f64>) -> String {
    match percent {
        Some(p) => format!("{:.1}%", p),
        None => "未知".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_fmt_opt_bytes_unavailable() {
        assert_eq!(fmt_opt_bytes(None), "无数据");
        assert_eq!(fmt_opt_bytes(Some(1024)), "1.00 KB");
    }

    #[test]
    fn test_parse_tunnel_type() {
        assert_eq!(parse_tunnel_type("tcp").unwrap(), TunnelType::Tcp);
        assert_eq!(parse_tunnel_type("https").unwrap(), TunnelType::Https);
        assert!(parse_tunnel_type("quic").is_err());
    }
}
