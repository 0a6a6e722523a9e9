//! 日志缓冲区
//!
//! 每个日志订阅一个有界环形缓冲区，支持暂停、过滤与导出。
//! 句柄可克隆共享：事件投递路径调用 `push`，展示侧只改标志位/过滤条件，
//! 不直接改动存储。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 默认容量，最多保留 1000 条
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// 一条日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    /// 推入总数（含已被淘汰的条目），供增量消费者定位
    total_pushed: u64,
    paused: bool,
    /// 展示期过滤条件：大小写不敏感的子串匹配，从不删数据
    filter: Option<String>,
}

/// 有界日志缓冲区
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                total_pushed: 0,
                paused: false,
                filter: None,
            })),
            capacity,
        }
    }

    /// 追加一条日志；满了淘汰最旧的，从不阻塞也从不无界增长。
    /// 暂停只影响展示侧的跟随行为，暂停期间的条目照常入库。
    pub fn push(&self, entry: LogEntry) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        inner.total_pushed += 1;
    }

    /// 暂停展示侧的自动跟随（数据继续累积）
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// 恢复跟随；暂停期间累积的条目全部可见
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// 设置展示期过滤条件（子串匹配，大小写不敏感）
    pub fn set_filter(&self, pattern: &str) {
        let mut inner = self.inner.lock().unwrap();
        let pattern = pattern.trim();
        inner.filter = if pattern.is_empty() {
            None
        } else {
            Some(pattern.to_lowercase())
        };
    }

    /// 清除过滤条件，之前被隐藏的条目重新可见
    pub fn clear_filter(&self) {
        self.inner.lock().unwrap().filter = None;
    }

    /// 清空缓冲区
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    /// 当前保留的条目数
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 推入总数（含已淘汰），单调递增
    pub fn total_pushed(&self) -> u64 {
        self.inner.lock().unwrap().total_pushed
    }

    /// 过滤后的展示视图
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        match &inner.filter {
            None => inner.entries.iter().cloned().collect(),
            Some(pattern) => inner
                .entries
                .iter()
                .filter(|e| e.text.to_lowercase().contains(pattern))
                .cloned()
                .collect(),
        }
    }

    /// 导出全部未过滤内容，每行 `[时间戳] 文本`。
    /// 始终忽略当前过滤条件，导出不会被搜索词悄悄截断。
    pub fn export_text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        for entry in &inner.entries {
            out.push('[');
            out.push_str(&entry.timestamp.to_rfc3339());
            out.push_str("] ");
            out.push_str(&entry.text);
            out.push('\n');
        }
        out
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            text: text.to_string(),
            client_id: None,
        }
    }

    #[test]
    fn test_overflow_evicts_oldest_first() {
        let buffer = LogBuffer::new(1000);
        for i in 0..1500 {
            buffer.push(entry(&format!("line-{}", i)));
        }

        // 只保留最近 1000 条，最旧的先被淘汰
        assert_eq!(buffer.len(), 1000);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.first().unwrap().text, "line-500");
        assert_eq!(snapshot.last().unwrap().text, "line-1499");
        assert_eq!(buffer.total_pushed(), 1500);
    }

    #[test]
    fn test_pause_does_not_drop_entries() {
        let buffer = LogBuffer::new(100);
        buffer.push(entry("before"));

        buffer.pause();
        assert!(buffer.is_paused());
        for i in 0..10 {
            buffer.push(entry(&format!("paused-{}", i)));
        }
        buffer.resume();
        assert!(!buffer.is_paused());

        // 暂停期间的 10 条全部可见
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 11);
        assert_eq!(snapshot.last().unwrap().text, "paused-9");
    }

    #[test]
    fn test_filter_is_display_only() {
        let buffer = LogBuffer::new(100);
        buffer.push(entry("connection established"));
        buffer.push(entry("Error: timeout"));
        buffer.push(entry("heartbeat ok"));

        buffer.set_filter("error");
        let filtered = buffer.snapshot();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].text, "Error: timeout");

        // 清除过滤后，被隐藏的条目重新可见
        buffer.clear_filter();
        assert_eq!(buffer.snapshot().len(), 3);
    }

    #[test]
    fn test_export_ignores_active_filter() {
        let buffer = LogBuffer::new(100);
        buffer.push(entry("kept by filter"));
        buffer.push(entry("excluded line"));

        buffer.set_filter("kept");
        assert_eq!(buffer.snapshot().len(), 1);

        // 导出始终包含被过滤掉的条目
        let exported = buffer.export_text();
        assert!(exported.contains("kept by filter"));
        assert!(exported.contains("excluded line"));
        assert_eq!(exported.lines().count(), 2);
    }

    #[test]
    fn test_export_line_format() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("hello"));
        let exported = buffer.export_text();
        let line = exported.lines().next().unwrap();
        assert!(line.starts_with('['));
        assert!(line.ends_with("] hello"));
    }

    #[test]
    fn test_clear() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("a"));
        buffer.push(entry("b"));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
