//! netplex - 引擎网络传输层
//!
//! 由连接编排器 `NetworkManager` 与可插拔的传输系统组成。
//! 内置的直连套接字系统使用一组就绪多路复用线程驱动非阻塞 TCP 套接字，
//! 所有事件通过单一队列汇集，在调用者线程的 `update` 中按因果顺序分发。

// 核心类型
pub mod error;
pub mod descriptor;
pub mod packet;
pub mod connection;
pub mod event;
pub mod stats;
pub mod config;

// 传输系统抽象与编排
pub mod system;
pub mod manager;

// 直连套接字系统
pub mod socket;

use std::sync::atomic::{AtomicU64, Ordering};

/// 连接ID的类型安全包装器
///
/// 进程内唯一，不会复用；监听套接字也从同一序列分配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// 创建新的连接ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 分配下一个全局唯一ID
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 获取原始ID值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ConnectionId> for u64 {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, TransportError>;

// 重新导出核心类型
pub use config::{ManagerConfig, SocketSystemConfig};
pub use connection::{
    BacklogCallback, Connection, ConnectionDirection, ConnectionDriver, ConnectionOwner, ConnectionState,
};
pub use descriptor::{AuxParam, ConnectionDescriptor};
pub use error::{CloseReason, TransportError};
pub use event::{IncomingConnectionListener, NetworkEvent, NetworkEventKind, NetworkEventListener};
pub use manager::{ManagerHandle, NetworkManager};
pub use packet::{Packet, PacketPool};
pub use socket::SocketSystem;
pub use stats::BandwidthSnapshot;
pub use system::TransportSystem;
