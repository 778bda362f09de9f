//! 从传输系统流向编排器的事件

use std::sync::Arc;

use crate::connection::Connection;
use crate::packet::Packet;

/// 接收监听描述符上接入的连接
///
/// 在编排器线程的 `NetworkManager::update` 中调用。
pub trait IncomingConnectionListener: Send + Sync {
    fn incoming_connection(&self, connection: &Arc<Connection>);
}

impl<F> IncomingConnectionListener for F
where
    F: Fn(&Arc<Connection>) + Send + Sync,
{
    fn incoming_connection(&self, connection: &Arc<Connection>) {
        self(connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEventKind {
    Established,
    IncomingConnection,
    Disconnected,
    PacketReceived,
}

/// 广播给所有已注册 [`NetworkEventListener`] 的通知
#[derive(Debug)]
pub enum NetworkEvent<'a> {
    /// 主动连接已完成
    Established(&'a Arc<Connection>),
    /// 监听器接入了连接
    IncomingConnection(&'a Arc<Connection>),
    /// 主动连接未完成即失败
    ConnectFailed(&'a Arc<Connection>),
    /// 已建立的连接掉线
    Disconnected(&'a Arc<Connection>),
    PacketReceived(&'a Arc<Connection>, &'a Packet),
}

impl NetworkEvent<'_> {
    pub fn kind(&self) -> NetworkEventKind {
        match self {
            NetworkEvent::Established(_) => NetworkEventKind::Established,
            NetworkEvent::IncomingConnection(_) => NetworkEventKind::IncomingConnection,
            NetworkEvent::ConnectFailed(_) | NetworkEvent::Disconnected(_) => NetworkEventKind::Disconnected,
            NetworkEvent::PacketReceived(..) => NetworkEventKind::PacketReceived,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            NetworkEvent::Established(c)
            | NetworkEvent::IncomingConnection(c)
            | NetworkEvent::ConnectFailed(c)
            | NetworkEvent::Disconnected(c)
            | NetworkEvent::PacketReceived(c, _) => c,
        }
    }
}

/// 观察编排器中所有连接，不区分传输系统
pub trait NetworkEventListener: Send + Sync {
    fn on_network_event(&self, event: &NetworkEvent<'_>);

    /// 关心的事件类型，默认全部
    fn interested_in(&self, _kind: NetworkEventKind) -> bool {
        true
    }
}

/// 传输系统排队、等待下一次 `update` 处理的工作
pub(crate) enum PendingEvent {
    Established(Arc<Connection>),
    Incoming {
        connection: Arc<Connection>,
        listener: Arc<dyn IncomingConnectionListener>,
    },
    Packet {
        connection: Arc<Connection>,
        packet: Packet,
    },
    Dropped(Arc<Connection>),
}
