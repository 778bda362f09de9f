//! 传输系统抽象
//!
//! 每个传输系统以名称注册到 `NetworkManager`，负责把描述符变成实际的
//! 监听/连接，并通过 `ManagerHandle` 把生命周期与数据事件送回编排器。
//! 所有回调都只在编排器线程的 `update` 中触发。

use std::sync::Arc;

use crate::connection::{ConnectCallback, Connection, DisconnectCallback};
use crate::descriptor::ConnectionDescriptor;
use crate::event::IncomingConnectionListener;
use crate::Result;

/// 可插拔的传输系统
pub trait TransportSystem: Send + Sync {
    /// 系统名称，对应描述符中的 `(system)` 前缀
    fn name(&self) -> &str;

    /// 安装时调用，失败则安装失败
    fn initialise(&self) -> Result<()> {
        Ok(())
    }

    /// 编排器启动时调用
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// 卸载时调用：停止工作线程并关闭所有套接字
    fn clean_up(&self) {}

    /// 断开所有连接，掉线通知照常经由编排器投递
    fn disconnect_all(&self);

    /// 支持的连接类型，如 `direct`、`passive`
    fn supported_kinds(&self) -> &[&'static str];

    /// 描述符附加参数的说明，如 `port=<u16>`
    fn additional_info_format(&self) -> &[&'static str] {
        &[]
    }

    /// 开始在 `descriptor` 上接受连接；不阻塞
    fn listen(
        &self,
        descriptor: &ConnectionDescriptor,
        listener: Arc<dyn IncomingConnectionListener>,
    ) -> Result<()>;

    /// 开始连接 `descriptor`，立即返回处于 Connecting 状态的连接；不阻塞
    ///
    /// 回调必须在连接对编排器可见之前注册。
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Arc<Connection>>;
}
