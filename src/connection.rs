//! 连接句柄，由调用者、编排器和驱动它的传输系统共享。
//!
//! 状态转换是原子的，无论哪个线程先发现故障，"掉线"都只会被报告一次。

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::descriptor::ConnectionDescriptor;
use crate::error::{CloseReason, TransportError};
use crate::packet::Packet;
use crate::ConnectionId;

pub type ConnectCallback = Arc<dyn Fn(&Arc<Connection>, bool) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type PacketCallback = Arc<dyn Fn(&Arc<Connection>, &Packet) + Send + Sync>;
/// 参数依次为连接、加入本次数据后的排队字节数、触发阈值、待发送的数据；
/// 返回 false 丢弃这份数据
pub type BacklogCallback = Arc<dyn Fn(&Connection, usize, usize, &Bytes) -> bool + Send + Sync>;

/// `connect` 注册回调时使用的标识
pub const CONNECT_CALLBACK_ID: &str = "connect";

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// 正在发起连接
    Connecting = 0,
    /// 已连接，正常工作
    Connected = 1,
    /// 已请求断开，等待传输系统释放套接字
    Closing = 2,
    /// 已关闭，终态
    Dropped = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Dropped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Outgoing,
    Incoming,
}

/// 连接的生命周期与数据通知接收者
///
/// 在编排器线程的 `NetworkManager::update` 中调用。
pub trait ConnectionOwner: Send + Sync {
    fn connection_established(&self, _connection: &Arc<Connection>) {}
    fn connection_dropped(&self, _connection: &Arc<Connection>) {}
    fn received_packet(&self, _connection: &Arc<Connection>, _packet: &Packet) {}
}

/// 连接通过它联系持有套接字的线程
pub trait ConnectionDriver: Send + Sync {
    /// 请求可写通知；套接字已不受管理时返回 false
    fn request_write(&self, id: ConnectionId) -> bool;
    /// 请求关闭并释放套接字
    fn request_close(&self, id: ConnectionId) -> bool;
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    close_after_flush: bool,
}

#[derive(Default)]
struct Callbacks {
    connect: Vec<(String, ConnectCallback)>,
    disconnect: Vec<(String, DisconnectCallback)>,
    packet: Vec<(String, PacketCallback)>,
}

fn upsert<T>(list: &mut Vec<(String, T)>, identifier: &str, value: T) {
    match list.iter_mut().find(|(id, _)| id == identifier) {
        Some(entry) => entry.1 = value,
        None => list.push((identifier.to_string(), value)),
    }
}

fn remove_named<T>(list: &mut Vec<(String, T)>, identifier: &str) -> bool {
    let before = list.len();
    list.retain(|(id, _)| id != identifier);
    list.len() != before
}

pub struct Connection {
    id: ConnectionId,
    system: String,
    descriptor: ConnectionDescriptor,
    direction: ConnectionDirection,
    state: AtomicU8,
    established: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    outbound: Mutex<Outbound>,
    outbound_limit: usize,
    write_pending: AtomicBool,
    driver: RwLock<Option<Arc<dyn ConnectionDriver>>>,
    owner: Mutex<Option<Weak<dyn ConnectionOwner>>>,
    callbacks: Mutex<Callbacks>,
    backlog_threshold: AtomicUsize,
    backlog_callback: RwLock<Option<BacklogCallback>>,
}

impl Connection {
    /// 主动连接，初始状态为 `Connecting`
    pub fn outgoing(
        id: ConnectionId,
        system: impl Into<String>,
        descriptor: ConnectionDescriptor,
        outbound_limit: usize,
    ) -> Self {
        Self::new(id, system.into(), descriptor, ConnectionDirection::Outgoing, outbound_limit)
    }

    /// 被动接入的连接，初始状态为 `Connected`
    pub fn incoming(
        id: ConnectionId,
        system: impl Into<String>,
        descriptor: ConnectionDescriptor,
        outbound_limit: usize,
    ) -> Self {
        let connection = Self::new(id, system.into(), descriptor, ConnectionDirection::Incoming, outbound_limit);
        connection.state.store(ConnectionState::Connected as u8, Ordering::Release);
        connection.established.store(true, Ordering::Release);
        connection
    }

    fn new(
        id: ConnectionId,
        system: String,
        descriptor: ConnectionDescriptor,
        direction: ConnectionDirection,
        outbound_limit: usize,
    ) -> Self {
        Self {
            id,
            system,
            descriptor,
            direction,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            established: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            outbound: Mutex::new(Outbound::default()),
            outbound_limit,
            write_pending: AtomicBool::new(false),
            driver: RwLock::new(None),
            owner: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            backlog_threshold: AtomicUsize::new(0),
            backlog_callback: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 所属传输系统的名称
    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// 日志用的可读标识，如 `(Socket)direct:127.0.0.1:port=9000 [127.0.0.1:9000]`
    pub fn friendly_identifier(&self) -> String {
        let base = self.descriptor.with_system(self.system.as_str()).to_string();
        match self.remote_addr() {
            Some(addr) => format!("{} [{}]", base, addr),
            None => base,
        }
    }

    /// 同 [`friendly_identifier`](Self::friendly_identifier)，但取本端地址
    pub fn local_friendly_identifier(&self) -> String {
        let base = self.descriptor.with_system(self.system.as_str()).to_string();
        match self.local_addr() {
            Some(addr) => format!("{} [{}]", base, addr),
            None => base,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_dropped(&self) -> bool {
        self.state() == ConnectionState::Dropped
    }

    /// 传输层是否曾完成连接
    pub fn was_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// 已被 `send` 接受、尚未写入套接字的字节数
    pub fn queued_bytes(&self) -> usize {
        self.outbound.lock().queued_bytes
    }

    /// 将 `data` 排入发送队列
    ///
    /// 连接建立前发送的数据会先缓存，连接完成后再写出。
    /// 已请求断开、超出单连接缓冲上限或被回压回调拒绝时失败。
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let data = data.into();
        match self.state() {
            ConnectionState::Closing | ConnectionState::Dropped => {
                return Err(TransportError::connection_error(
                    format!("connection {} is closed", self.id),
                    false,
                ));
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        if data.is_empty() {
            return Ok(());
        }

        let queued = self.check_outbound(&self.outbound.lock(), data.len())?;
        self.consult_backlog(queued, &data)?;

        {
            let mut outbound = self.outbound.lock();
            // 回调期间队列可能已变化
            self.check_outbound(&outbound, data.len())?;
            outbound.queued_bytes += data.len();
            outbound.queue.push_back(data);
        }

        self.request_write();
        Ok(())
    }

    /// 返回加入 `len` 字节后的排队总量
    fn check_outbound(&self, outbound: &Outbound, len: usize) -> Result<usize, TransportError> {
        if outbound.close_after_flush {
            return Err(TransportError::connection_error(
                format!("connection {} is closing", self.id),
                false,
            ));
        }
        let queued = outbound.queued_bytes + len;
        if queued > self.outbound_limit {
            return Err(TransportError::capacity_error("outbound buffer", queued, self.outbound_limit));
        }
        Ok(queued)
    }

    fn consult_backlog(&self, queued: usize, data: &Bytes) -> Result<(), TransportError> {
        let threshold = self.backlog_threshold.load(Ordering::Acquire);
        if threshold == 0 || queued < threshold {
            return Ok(());
        }
        let Some(callback) = self.backlog_callback.read().clone() else {
            return Ok(());
        };
        if callback(self, queued, threshold, data) {
            return Ok(());
        }
        tracing::debug!(id = %self.id, queued, threshold, "send discarded by backlog callback");
        Err(TransportError::capacity_error("send backlog", queued, threshold))
    }

    /// 排队字节数（含本次）达到阈值时，每次 `send` 都会先询问回调；
    /// 阈值为 0 表示不检查
    pub fn set_backlog_callback<F>(&self, threshold: usize, callback: F)
    where
        F: Fn(&Connection, usize, usize, &Bytes) -> bool + Send + Sync + 'static,
    {
        *self.backlog_callback.write() = Some(Arc::new(callback) as BacklogCallback);
        self.backlog_threshold.store(threshold, Ordering::Release);
    }

    pub fn set_backlog_threshold(&self, threshold: usize) {
        self.backlog_threshold.store(threshold, Ordering::Release);
    }

    pub fn backlog_threshold(&self) -> usize {
        self.backlog_threshold.load(Ordering::Acquire)
    }

    pub fn clear_backlog_callback(&self) {
        self.backlog_callback.write().take();
    }

    /// 关闭连接，掉线通知随后经编排器送达
    pub fn disconnect(&self) {
        if !self.begin_close() {
            return;
        }
        tracing::debug!(id = %self.id, "disconnect requested");
        if let Some(driver) = self.driver.read().clone() {
            driver.request_close(self.id);
        }
    }

    /// 已排队的数据全部写出后再关闭
    pub fn disconnect_after_flush(&self) {
        let empty = {
            let mut outbound = self.outbound.lock();
            outbound.close_after_flush = true;
            outbound.queue.is_empty()
        };
        if empty {
            self.disconnect();
        } else {
            self.request_write();
        }
    }

    pub fn set_owner(&self, owner: Weak<dyn ConnectionOwner>) {
        *self.owner.lock() = Some(owner);
    }

    pub fn clear_owner(&self) {
        self.owner.lock().take();
    }

    /// 注册（或替换）`identifier` 下的连接回调
    pub fn add_connect_callback<F>(&self, identifier: &str, callback: F)
    where
        F: Fn(&Arc<Connection>, bool) + Send + Sync + 'static,
    {
        upsert(&mut self.callbacks.lock().connect, identifier, Arc::new(callback) as ConnectCallback);
    }

    pub fn add_disconnect_callback<F>(&self, identifier: &str, callback: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        upsert(&mut self.callbacks.lock().disconnect, identifier, Arc::new(callback) as DisconnectCallback);
    }

    pub fn add_packet_callback<F>(&self, identifier: &str, callback: F)
    where
        F: Fn(&Arc<Connection>, &Packet) + Send + Sync + 'static,
    {
        upsert(&mut self.callbacks.lock().packet, identifier, Arc::new(callback) as PacketCallback);
    }

    /// 注册已共享的连接回调
    pub fn add_shared_connect_callback(&self, identifier: &str, callback: ConnectCallback) {
        upsert(&mut self.callbacks.lock().connect, identifier, callback);
    }

    pub fn add_shared_disconnect_callback(&self, identifier: &str, callback: DisconnectCallback) {
        upsert(&mut self.callbacks.lock().disconnect, identifier, callback);
    }

    pub fn remove_connect_callback(&self, identifier: &str) -> bool {
        remove_named(&mut self.callbacks.lock().connect, identifier)
    }

    pub fn remove_disconnect_callback(&self, identifier: &str) -> bool {
        remove_named(&mut self.callbacks.lock().disconnect, identifier)
    }

    pub fn remove_packet_callback(&self, identifier: &str) -> bool {
        remove_named(&mut self.callbacks.lock().packet, identifier)
    }

    pub fn clear_connect_callbacks(&self) {
        self.callbacks.lock().connect.clear();
    }

    pub fn clear_disconnect_callbacks(&self) {
        self.callbacks.lock().disconnect.clear();
    }

    pub fn clear_packet_callbacks(&self) {
        self.callbacks.lock().packet.clear();
    }

    pub fn clear_all_callbacks(&self) {
        *self.callbacks.lock() = Callbacks::default();
    }

    // ---- 传输系统侧 ----

    /// 写入与关闭请求经此转给持有套接字的线程
    pub fn attach_driver(&self, driver: Arc<dyn ConnectionDriver>) {
        *self.driver.write() = Some(driver);
        if self.has_outbound() {
            self.write_pending.store(false, Ordering::Release);
            self.request_write();
        }
    }

    pub fn set_addresses(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        if local.is_some() {
            *self.local_addr.lock() = local;
        }
        if remote.is_some() {
            *self.remote_addr.lock() = remote;
        }
    }

    /// `Connecting -> Connected`；连接已进入关闭或掉线时返回 false
    pub fn mark_connected(&self) -> bool {
        let swapped = self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.established.store(true, Ordering::Release);
        }
        swapped
    }

    /// 从 `Connecting` 或 `Connected` 进入 `Closing`
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match ConnectionState::from_u8(current) {
                ConnectionState::Closing | ConnectionState::Dropped => return false,
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 进入 `Dropped`。每个连接只有一次返回 true，
    /// 拿到 true 的调用者负责报告掉线
    pub fn mark_dropped(&self, reason: CloseReason) -> bool {
        let previous = self.state.swap(ConnectionState::Dropped as u8, Ordering::AcqRel);
        if previous == ConnectionState::Dropped as u8 {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        let mut outbound = self.outbound.lock();
        outbound.queue.clear();
        outbound.queued_bytes = 0;
        true
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.lock().queue.is_empty()
    }

    /// 查看发送队列队首，不移除
    pub fn peek_outbound(&self) -> Option<Bytes> {
        self.outbound.lock().queue.front().cloned()
    }

    /// 从队首移除已写出的 `written` 字节
    pub fn consume_outbound(&self, mut written: usize) {
        let mut outbound = self.outbound.lock();
        outbound.queued_bytes = outbound.queued_bytes.saturating_sub(written);
        while written > 0 {
            let Some(front) = outbound.queue.front_mut() else { break };
            if written >= front.len() {
                written -= front.len();
                outbound.queue.pop_front();
            } else {
                let _ = front.split_to(written);
                written = 0;
            }
        }
    }

    /// 传输系统清空队列后调用；期间又有新数据时返回 true，
    /// 此时须保持写关注
    pub fn finish_flush(&self) -> bool {
        self.write_pending.store(false, Ordering::Release);
        if self.has_outbound() {
            self.write_pending.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// 队列已清空且请求过写完再关闭
    pub fn close_after_flush_due(&self) -> bool {
        let outbound = self.outbound.lock();
        outbound.close_after_flush && outbound.queue.is_empty()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn request_write(&self) {
        if self.write_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let accepted = match self.driver.read().clone() {
            Some(driver) => driver.request_write(self.id),
            None => false,
        };
        if !accepted {
            self.write_pending.store(false, Ordering::Release);
        }
    }

    // ---- 编排器侧 ----

    fn owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn notify_connect(self: &Arc<Self>, success: bool) {
        if success {
            if let Some(owner) = self.owner() {
                owner.connection_established(self);
            }
        }
        let callbacks: Vec<ConnectCallback> =
            self.callbacks.lock().connect.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(self, success);
        }
    }

    pub(crate) fn notify_dropped(self: &Arc<Self>) {
        if let Some(owner) = self.owner() {
            owner.connection_dropped(self);
        }
        let callbacks: Vec<DisconnectCallback> =
            self.callbacks.lock().disconnect.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(self);
        }
    }

    pub(crate) fn notify_packet(self: &Arc<Self>, packet: &Packet) {
        if let Some(owner) = self.owner() {
            owner.received_packet(self, packet);
        }
        let callbacks: Vec<PacketCallback> =
            self.callbacks.lock().packet.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(self, packet);
        }
    }

    /// 释放连接替调用者持有的全部资源
    pub(crate) fn release(&self) {
        self.clear_all_callbacks();
        self.clear_backlog_callback();
        self.clear_owner();
        self.driver.write().take();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("system", &self.system)
            .field("descriptor", &self.descriptor.to_string())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
