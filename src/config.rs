//! 控制台配置模块

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logbuf::DEFAULT_LOG_CAPACITY;
use crate::reconcile::DEFAULT_ONLINE_WINDOW_SECS;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "frp-console.toml";

/// 控制台配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 面板地址（例如 http://panel:8000）
    pub panel_url: String,
    /// 登录后获得的 Bearer Token
    #[serde(default)]
    pub token: Option<String>,
    /// 在线判定窗口（秒），全部调用点统一使用这一个值
    #[serde(default = "default_online_window")]
    pub online_window_secs: i64,
    /// 推送通道重连间隔（秒），固定间隔、无退避
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// REST 数据源轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 每客户端日志缓冲区容量
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Config {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref)
            .with_context(|| format!("无法读取配置文件: {}", path_ref.display()))?;

        let config: Config = toml::from_str(&content).with_context(|| "解析配置文件失败")?;
        Ok(config)
    }

    /// 加载默认配置文件
    pub fn load_default() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_FILE)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panel_url: String::new(),
            token: None,
            online_window_secs: default_online_window(),
            reconnect_interval_secs: default_reconnect_interval(),
            poll_interval_secs: default_poll_interval(),
            log_capacity: default_log_capacity(),
        }
    }
}

fn default_online_window() -> i64 {
    DEFAULT_ONLINE_WINDOW_SECS
}

fn default_reconnect_interval() -> u64 {
    crate::stream::DEFAULT_RECONNECT_INTERVAL.as_secs()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}
