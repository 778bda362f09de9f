//! 配置
//!
//! 编排器与直连套接字系统各有一份配置，均可从 TOML/JSON 等格式反序列化，
//! 缺省字段取默认值。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TransportError;

/// 编排器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// 预分配的数据包数量
    pub packet_pool_size: usize,
    /// 每个数据包的缓冲区大小
    pub packet_buffer_size: usize,
    /// 每个连接的发送缓冲上限（字节）
    pub new_connection_buffer_size: usize,
    /// 单次 update 最多处理的事件数，None 表示处理调用时已排队的全部事件
    pub max_events_per_update: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            packet_pool_size: 512,
            packet_buffer_size: 8192,
            new_connection_buffer_size: 5 * 1024 * 1024, // 5MB
            max_events_per_update: None,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.packet_buffer_size == 0 {
            return Err(TransportError::config_error("packet_buffer_size", "must be greater than 0"));
        }
        if self.new_connection_buffer_size == 0 {
            return Err(TransportError::config_error("new_connection_buffer_size", "must be greater than 0"));
        }
        if self.max_events_per_update == Some(0) {
            return Err(TransportError::config_error("max_events_per_update", "must be greater than 0"));
        }
        Ok(())
    }

    /// 设置数据包池大小
    pub fn with_packet_pool_size(mut self, count: usize) -> Self {
        self.packet_pool_size = count;
        self
    }

    /// 设置数据包缓冲区大小
    pub fn with_packet_buffer_size(mut self, size: usize) -> Self {
        self.packet_buffer_size = size;
        self
    }

    /// 设置每个连接的发送缓冲上限
    pub fn with_new_connection_buffer_size(mut self, size: usize) -> Self {
        self.new_connection_buffer_size = size;
        self
    }

    pub fn with_max_events_per_update(mut self, max: Option<usize>) -> Self {
        self.max_events_per_update = max;
        self
    }
}

/// 直连套接字系统配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSystemConfig {
    /// 系统名称，即描述符中的 `(system)` 前缀
    pub name: String,
    /// 每个多路复用线程最多管理的套接字数
    pub max_sockets_per_thread: usize,
    /// 多路复用线程数上限
    pub max_threads: usize,
    /// 单次就绪等待的超时（毫秒）
    pub poll_timeout_ms: u64,
    /// 连接超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 空闲超时（毫秒），None 表示不检测
    pub idle_timeout_ms: Option<u64>,
    /// 单次读取的最大字节数
    pub max_read_size: usize,
    /// 每次就绪事件最多读取的次数，用完后下一轮循环继续读
    pub max_reads_per_event: usize,
    /// 超时扫描间隔（毫秒）
    pub sweep_interval_ms: u64,
    /// 监听队列长度
    pub listen_backlog: i32,
    /// TCP_NODELAY选项
    pub nodelay: bool,
}

impl Default for SocketSystemConfig {
    fn default() -> Self {
        Self {
            name: "Socket".to_string(),
            max_sockets_per_thread: 1024,
            max_threads: 64,
            poll_timeout_ms: 250,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: None,
            max_read_size: 8192,
            max_reads_per_event: 16,
            sweep_interval_ms: 100,
            listen_backlog: 128,
            nodelay: true,
        }
    }
}

impl SocketSystemConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.name.is_empty() || self.name.contains(['(', ')']) {
            return Err(TransportError::config_error("name", "must be non-empty and free of parentheses"));
        }
        if self.max_sockets_per_thread == 0 {
            return Err(TransportError::config_error("max_sockets_per_thread", "must be greater than 0"));
        }
        if self.max_threads == 0 {
            return Err(TransportError::config_error("max_threads", "must be greater than 0"));
        }
        if self.max_read_size == 0 {
            return Err(TransportError::config_error("max_read_size", "must be greater than 0"));
        }
        if self.max_reads_per_event == 0 {
            return Err(TransportError::config_error("max_reads_per_event", "must be greater than 0"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(TransportError::config_error("poll_timeout_ms", "must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::config_error("connect_timeout_ms", "must be greater than 0"));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(TransportError::config_error("idle_timeout_ms", "must be greater than 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(TransportError::config_error("listen_backlog", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// 设置系统名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 设置单线程套接字容量
    pub fn with_max_sockets_per_thread(mut self, max: usize) -> Self {
        self.max_sockets_per_thread = max;
        self
    }

    /// 设置工作线程上限
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置连接超时
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置空闲超时
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_max_read_size(mut self, size: usize) -> Self {
        self.max_read_size = size;
        self
    }

    pub fn with_max_reads_per_event(mut self, max: usize) -> Self {
        self.max_reads_per_event = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// 设置TCP_NODELAY选项
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}
