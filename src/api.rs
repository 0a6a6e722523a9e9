//! 面板 REST 协作方客户端
//!
//! 请求/响应式接口：注册客户端列表、隧道服务器运行时状态、Agent 列表
//! 各自可独立失败；隧道变更接口只用于触发一次重新拉取/合并。

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::model::{
    AgentHeartbeat, RegisteredClient, ServerStatus, TunnelConfig, TunnelCreate,
};

/// 登录响应
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct AgentsResponse {
    #[serde(default)]
    agents: Vec<AgentHeartbeat>,
}

#[derive(Debug, Default, Deserialize)]
struct DisabledPortsResponse {
    #[serde(default)]
    disabled_ports: Vec<u16>,
}

/// 面板 API 客户端
///
/// 凭证集中缓存在这里；收到会话失效信号时由会话层调用
/// `clear_token` 清除，之后所有请求都会要求重新登录。
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(panel_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: panel_url.trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 当前缓存的凭证
    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    /// 清除缓存凭证（鉴权失败后强制重新登录）
    pub fn clear_token(&self) {
        *self.token.write().unwrap() = None;
    }

    /// 用户名密码换取 Bearer Token 并缓存
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let url = format!("{}/token", self.base_url);
        let resp = self
            .http
            .post(&url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .with_context(|| format!("无法连接到面板: {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("登录失败 ({}): {}", status, body));
        }

        let token: TokenResponse = resp.json().await.with_context(|| "解析登录响应失败")?;
        *self.token.write().unwrap() = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("请求失败: {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("面板返回错误 ({}): {}", status, body));
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("解析响应失败: {}", url))
    }

    /// 拉取注册客户端及其隧道配置
    pub async fn fetch_clients(&self) -> Result<Vec<RegisteredClient>> {
        self.get_json("/clients/").await
    }

    /// 拉取 Agent 心跳列表（可独立失败）
    pub async fn fetch_agents(&self) -> Result<Vec<AgentHeartbeat>> {
        let resp: AgentsResponse = self.get_json("/api/agents").await?;
        Ok(resp.agents)
    }

    /// 拉取隧道服务器运行时状态（可独立失败）
    ///
    /// `success=false` 的响应不是传输错误：表示隧道服务器本身不可达，
    /// 调用方应将代理源视为不可用（None）而继续渲染其余数据。
    pub async fn fetch_server_status(&self) -> Result<ServerStatus> {
        let status: ServerStatus = self.get_json("/api/frp/server-status").await?;
        if !status.success {
            warn!(
                "隧道服务器状态查询未成功: {}",
                status.message.as_deref().unwrap_or("unknown")
            );
        }
        Ok(status)
    }

    /// 拉取禁用端口列表
    pub async fn fetch_disabled_ports(&self) -> Result<Vec<u16>> {
        let resp: DisabledPortsResponse = self.get_json("/api/frp/disabled-ports").await?;
        Ok(resp.disabled_ports)
    }

    /// 新建隧道（之后由调用方触发重新拉取/合并）
    pub async fn create_tunnel(&self, client_id: &str, tunnel: &TunnelCreate) -> Result<TunnelConfig> {
        let url = format!("{}/clients/{}/tunnels/", self.base_url, client_id);
        let mut req = self.http.post(&url).json(tunnel);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.with_context(|| format!("请求失败: {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("创建隧道失败 ({}): {}", status, body));
        }
        resp.json().await.with_context(|| "解析隧道响应失败")
    }

    /// 启用/禁用隧道
    pub async fn set_tunnel_enabled(&self, client_id: &str, tunnel_id: i64, enabled: bool) -> Result<()> {
        let url = format!("{}/clients/{}/tunnels/{}", self.base_url, client_id, tunnel_id);
        let mut req = self
            .http
            .patch(&url)
            .json(&serde_json::json!({ "enabled": enabled }));
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.with_context(|| format!("请求失败: {}", url))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("更新隧道失败 ({})", resp.status()));
        }
        Ok(())
    }

    /// 删除隧道
    pub async fn delete_tunnel(&self, client_id: &str, tunnel_id: i64) -> Result<()> {
        let url = format!("{}/clients/{}/tunnels/{}", self.base_url, client_id, tunnel_id);
        let mut req = self.http.delete(&url);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.with_context(|| format!("请求失败: {}", url))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("删除隧道失败 ({})", resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = ApiClient::new("http://panel:8000/", None);
        assert_eq!(api.base_url(), "http://panel:8000");
    }

    #[test]
    fn test_token_cache_roundtrip() {
        let api = ApiClient::new("http://panel:8000", Some("abc".to_string()));
        assert_eq!(api.token().as_deref(), Some("abc"));
        api.clear_token();
        assert!(api.token().is_none());
    }
}
