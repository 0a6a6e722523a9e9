//! 会话编排层
//!
//! `DashboardSession` 维护全舰队状态订阅并发布派生视图；
//! `LogSession` 为每个正在查看的客户端维护一条日志订阅。

pub mod dashboard;
pub mod logs;

pub use dashboard::{DashboardSession, DashboardSnapshot};
pub use logs::LogSession;

/// 需要上层处理的会话事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// 凭证已失效：缓存凭证已被清除，必须重新登录（不是静默重连）
    ForceLogout,
}
