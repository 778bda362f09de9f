//! 直连套接字传输系统
//!
//! 把 `direct`/`passive` 描述符变成非阻塞 TCP 监听与连接，套接字按容量分配到
//! 一组多路复用线程上（先找有空位的，否则新建线程，直到 `max_threads`）。
//! 工作线程只通过 `ManagerHandle` 入队事件，可见副作用都发生在编排器的
//! `update` 中。

pub mod multiplexer;
pub mod platform;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SocketSystemConfig;
use crate::connection::{
    ConnectCallback, Connection, ConnectionState, DisconnectCallback, CONNECT_CALLBACK_ID,
};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{CloseReason, TransportError};
use crate::event::IncomingConnectionListener;
use crate::manager::ManagerHandle;
use crate::system::TransportSystem;
use crate::{ConnectionId, Result};

use self::multiplexer::{LoopSettings, Multiplexer, MultiplexerShared, Readiness, ReadinessHandler, SocketAction};
use self::platform::{MioPlatform, RawSocket, SocketPlatform};

const KIND_DIRECT: &str = "direct";
const KIND_PASSIVE: &str = "passive";
const ANY_ADDRESS: &str = "ANY";

/// 系统登记的套接字
#[derive(Clone)]
enum SocketEntry {
    Listener {
        listener: Arc<dyn IncomingConnectionListener>,
        descriptor: ConnectionDescriptor,
        addr: SocketAddr,
    },
    Stream(Arc<Connection>),
}

enum ReadOutcome {
    Drained,
    /// 配额用完，套接字里可能还有数据
    BudgetExhausted,
    Closed(CloseReason),
}

struct SystemShared {
    me: Weak<SystemShared>,
    config: SocketSystemConfig,
    handle: ManagerHandle,
    platform: Arc<dyn SocketPlatform>,
    dispatch: tracing::Dispatch,
    entries: Mutex<HashMap<ConnectionId, SocketEntry>>,
    workers: Mutex<Vec<Multiplexer>>,
    started: AtomicBool,
    cleaned: AtomicBool,
}

/// 直连套接字传输系统
///
/// 工作线程在 `start` 之后才开始轮询；之前分配的套接字会排队等待。
pub struct SocketSystem {
    shared: Arc<SystemShared>,
}

impl SocketSystem {
    pub fn new(handle: ManagerHandle, config: SocketSystemConfig) -> Result<Self> {
        Self::with_platform(handle, config, Arc::new(MioPlatform))
    }

    /// 使用自定义套接字平台
    pub fn with_platform(
        handle: ManagerHandle,
        config: SocketSystemConfig,
        platform: Arc<dyn SocketPlatform>,
    ) -> Result<Self> {
        config.validate()?;
        // 工作线程沿用构造者当前的日志订阅者
        let dispatch = tracing::dispatcher::get_default(|dispatch| dispatch.clone());
        let shared = Arc::new_cyclic(|me| SystemShared {
            me: me.clone(),
            config,
            handle,
            platform,
            dispatch,
            entries: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> &SocketSystemConfig {
        &self.shared.config
    }

    /// 当前监听的地址（端口0已替换为实际端口）
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        let entries = self.shared.entries.lock();
        let mut listeners: Vec<(ConnectionId, SocketAddr)> = entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                SocketEntry::Listener { addr, .. } => Some((*id, *addr)),
                SocketEntry::Stream(_) => None,
            })
            .collect();
        listeners.sort_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, addr)| addr).collect()
    }

    /// 多路复用线程数
    pub fn thread_count(&self) -> usize {
        self.shared.workers.lock().len()
    }

    /// 每个多路复用器上的套接字数
    pub fn sockets_per_thread(&self) -> Vec<usize> {
        self.shared.workers.lock().iter().map(|m| m.shared().socket_count()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, SocketEntry::Stream(_)))
            .count()
    }
}

impl Drop for SocketSystem {
    fn drop(&mut self) {
        self.shared.clean_up();
    }
}

impl TransportSystem for SocketSystem {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn start(&self) -> Result<()> {
        self.shared.start()
    }

    fn clean_up(&self) {
        self.shared.clean_up();
    }

    fn disconnect_all(&self) {
        self.shared.disconnect_all();
    }

    fn supported_kinds(&self) -> &[&'static str] {
        &[KIND_DIRECT, KIND_PASSIVE]
    }

    fn additional_info_format(&self) -> &[&'static str] {
        &["port=<u16>"]
    }

    fn listen(&self, descriptor: &ConnectionDescriptor, listener: Arc<dyn IncomingConnectionListener>) -> Result<()> {
        self.shared.listen(descriptor, listener)
    }

    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Arc<Connection>> {
        self.shared.connect(descriptor, on_connect, on_disconnect)
    }
}

fn required_port(descriptor: &ConnectionDescriptor) -> Result<u16> {
    descriptor
        .port()
        .ok_or_else(|| TransportError::descriptor_error(descriptor.to_string(), "missing port"))?
}

fn listen_ip(descriptor: &ConnectionDescriptor) -> Result<IpAddr> {
    let host = descriptor.host();
    if host.eq_ignore_ascii_case(ANY_ADDRESS) {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse()
        .map_err(|_| TransportError::descriptor_error(descriptor.to_string(), "listen address must be an IP, ANY or localhost"))
}

impl SystemShared {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            poll_timeout: self.config.poll_timeout(),
            sweep_interval: self.config.sweep_interval(),
        }
    }

    fn spawn_worker(&self, multiplexer: &mut Multiplexer) -> Result<()> {
        let handler: Arc<dyn ReadinessHandler> = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::connection_error("socket system is shutting down", false))?;
        let name = format!("{}-mux-{}", self.name(), multiplexer.shared().index());
        multiplexer.spawn(name, handler, self.dispatch.clone())?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for multiplexer in workers.iter_mut().filter(|m| !m.is_spawned()) {
            self.spawn_worker(multiplexer)?;
        }
        tracing::info!(system = %self.name(), threads = workers.len(), "socket system started");
        Ok(())
    }

    /// 把套接字交给第一个有空位的多路复用器，必要时新建一个
    fn assign(&self, id: ConnectionId, socket: RawSocket, write_interest: bool) -> Result<Arc<MultiplexerShared>> {
        let mut workers = self.workers.lock();
        if self.cleaned.load(Ordering::Acquire) {
            self.platform.close(socket);
            return Err(TransportError::connection_error("socket system is shut down", false));
        }

        let mut socket = socket;
        for multiplexer in workers.iter() {
            let shared = multiplexer.shared();
            if !shared.has_capacity() {
                continue;
            }
            match shared.add_socket(id, socket, write_interest) {
                Ok(()) => return Ok(shared.clone()),
                Err(returned) => socket = returned,
            }
        }

        if workers.len() >= self.config.max_threads {
            self.platform.close(socket);
            return Err(TransportError::capacity_error(
                "multiplexer threads",
                workers.len(),
                self.config.max_threads,
            ));
        }

        let mut multiplexer = match Multiplexer::new(workers.len(), self.config.max_sockets_per_thread, self.loop_settings()) {
            Ok(multiplexer) => multiplexer,
            Err(e) => {
                self.platform.close(socket);
                return Err(e.into());
            }
        };
        if self.started.load(Ordering::Acquire) {
            if let Err(e) = self.spawn_worker(&mut multiplexer) {
                self.platform.close(socket);
                return Err(e);
            }
        }
        let shared = multiplexer.shared().clone();
        if let Err(returned) = shared.add_socket(id, socket, write_interest) {
            self.platform.close(returned);
            return Err(TransportError::capacity_error("multiplexer sockets", 0, self.config.max_sockets_per_thread));
        }
        tracing::debug!(system = %self.name(), multiplexer = shared.index(), "multiplexer created");
        workers.push(multiplexer);
        Ok(shared)
    }

    fn listen(&self, descriptor: &ConnectionDescriptor, listener: Arc<dyn IncomingConnectionListener>) -> Result<()> {
        match descriptor.kind() {
            KIND_DIRECT | KIND_PASSIVE => {}
            other => return Err(TransportError::unsupported(self.name(), other)),
        }
        let port = required_port(descriptor)?;
        let addr = SocketAddr::new(listen_ip(descriptor)?, port);

        let socket = self.platform.listen(addr, self.config.listen_backlog)?;
        let bound = socket.local_addr().unwrap_or(addr);
        let id = ConnectionId::next();
        self.entries.lock().insert(
            id,
            SocketEntry::Listener {
                listener,
                descriptor: descriptor.with_system(self.name()),
                addr: bound,
            },
        );
        if let Err(e) = self.assign(id, socket, false) {
            self.entries.lock().remove(&id);
            return Err(e);
        }

        tracing::info!(system = %self.name(), %bound, "listening");
        Ok(())
    }

    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Arc<Connection>> {
        match descriptor.kind() {
            KIND_DIRECT => {}
            other => return Err(TransportError::unsupported(self.name(), other)),
        }
        let port = required_port(descriptor)?;

        let connection = Arc::new(Connection::outgoing(
            ConnectionId::next(),
            self.name(),
            descriptor.with_system(self.name()),
            self.handle.new_connection_buffer_size(),
        ));
        if let Some(callback) = on_connect {
            connection.add_shared_connect_callback(CONNECT_CALLBACK_ID, callback);
        }
        if let Some(callback) = on_disconnect {
            connection.add_shared_disconnect_callback(CONNECT_CALLBACK_ID, callback);
        }
        self.entries.lock().insert(connection.id(), SocketEntry::Stream(connection.clone()));

        let started = match descriptor.host().parse::<IpAddr>() {
            Ok(ip) => self.begin_connect(&connection, SocketAddr::new(ip, port)),
            Err(_) => self.spawn_resolver(connection.clone(), descriptor.host().to_string(), port),
        };
        if let Err(e) = started {
            self.entries.lock().remove(&connection.id());
            return Err(e);
        }
        Ok(connection)
    }

    /// 发起非阻塞连接；只有容量错误同步返回，套接字错误以掉线通知上报
    fn begin_connect(&self, connection: &Arc<Connection>, addr: SocketAddr) -> Result<()> {
        let socket = match self.platform.connect(addr, self.config.nodelay) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!(id = %connection.id(), %addr, error = %e, "connect failed immediately");
                self.fail_pending(connection, CloseReason::Error(e.to_string()));
                return Ok(());
            }
        };
        connection.set_addresses(socket.local_addr().ok(), Some(addr));

        let multiplexer = self.assign(connection.id(), socket, true)?;
        connection.attach_driver(multiplexer.clone());
        // 挂上驱动之前的 disconnect() 无法送达
        if connection.state() == ConnectionState::Closing {
            multiplexer.remove_socket(connection.id());
        }
        tracing::debug!(id = %connection.id(), %addr, multiplexer = multiplexer.index(), "connecting");
        Ok(())
    }

    fn spawn_resolver(&self, connection: Arc<Connection>, host: String, port: u16) -> Result<()> {
        let shared = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::connection_error("socket system is shutting down", false))?;
        let dispatch = self.dispatch.clone();
        thread::Builder::new()
            .name(format!("{}-resolve", self.name()))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || shared.resolve_and_connect(&connection, &host, port));
            })?;
        Ok(())
    }

    fn resolve_and_connect(&self, connection: &Arc<Connection>, host: &str, port: u16) {
        let resolved = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                tracing::warn!(id = %connection.id(), host, error = %e, "host resolution failed");
                None
            }
        };
        let Some(addr) = resolved else {
            self.fail_pending(connection, CloseReason::Error(format!("could not resolve {}", host)));
            return;
        };
        if connection.state() != ConnectionState::Connecting {
            self.fail_pending(connection, CloseReason::Normal);
            return;
        }
        if let Err(e) = self.begin_connect(connection, addr) {
            tracing::warn!(id = %connection.id(), %addr, error = %e, "connect could not be scheduled");
            self.fail_pending(connection, CloseReason::Error(e.to_string()));
        }
    }

    /// 结束一个从未交给多路复用器的连接
    fn fail_pending(&self, connection: &Arc<Connection>, reason: CloseReason) {
        self.entries.lock().remove(&connection.id());
        if connection.mark_dropped(reason) {
            self.handle.connection_dropped(connection.clone());
        }
    }

    fn accept_pending(
        &self,
        socket: &RawSocket,
        listener: &Arc<dyn IncomingConnectionListener>,
        descriptor: &ConnectionDescriptor,
    ) {
        loop {
            match self.platform.accept(socket, self.config.nodelay) {
                Ok((stream, peer)) => self.adopt_incoming(stream, peer, listener, descriptor),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(listener = %descriptor, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn adopt_incoming(
        &self,
        stream: RawSocket,
        peer: SocketAddr,
        listener: &Arc<dyn IncomingConnectionListener>,
        descriptor: &ConnectionDescriptor,
    ) {
        let peer_address = match peer.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        let remote = ConnectionDescriptor::builder(KIND_DIRECT, peer_address)
            .system(self.name())
            .param("port", peer.port().to_string())
            .build()
            .unwrap_or_else(|_| descriptor.clone());

        let connection = Arc::new(Connection::incoming(
            ConnectionId::next(),
            self.name(),
            remote,
            self.handle.new_connection_buffer_size(),
        ));
        connection.set_addresses(stream.local_addr().ok(), Some(peer));
        self.entries.lock().insert(connection.id(), SocketEntry::Stream(connection.clone()));
        // 必须先于该连接的任何数据包事件入队
        self.handle.connection_incoming(connection.clone(), listener.clone());

        match self.assign(connection.id(), stream, false) {
            Ok(multiplexer) => {
                connection.attach_driver(multiplexer.clone());
                if connection.state() == ConnectionState::Closing {
                    multiplexer.remove_socket(connection.id());
                }
                tracing::debug!(id = %connection.id(), %peer, multiplexer = multiplexer.index(), "accepted");
            }
            Err(e) => {
                self.entries.lock().remove(&connection.id());
                tracing::warn!(%peer, error = %e, "accepted connection rejected");
                if connection.mark_dropped(CloseReason::Error(e.to_string())) {
                    self.handle.connection_dropped(connection);
                }
            }
        }
    }

    fn service_stream(&self, connection: &Arc<Connection>, socket: &mut RawSocket, readiness: Readiness) -> SocketAction {
        let mut flush = readiness.writable;

        if connection.state() == ConnectionState::Connecting {
            match self.platform.connect_result(socket) {
                Ok(None) => return SocketAction::KeepWriting,
                Ok(Some(peer)) => {
                    connection.set_addresses(socket.local_addr().ok(), Some(peer));
                    if !connection.mark_connected() {
                        return SocketAction::Keep;
                    }
                    tracing::debug!(id = %connection.id(), %peer, "connected");
                    self.handle.connection_established(connection.clone());
                    flush = true;
                }
                Err(e) => return SocketAction::Remove(CloseReason::Error(e.to_string())),
            }
        }

        let mut more_input = false;
        if readiness.readable || readiness.closed || readiness.error {
            match self.read_available(connection, socket) {
                ReadOutcome::Drained => {}
                ReadOutcome::BudgetExhausted => more_input = true,
                ReadOutcome::Closed(reason) => return SocketAction::Remove(reason),
            }
        }

        let action = if flush {
            self.flush(connection, socket)
        } else {
            SocketAction::Keep
        };
        match action {
            SocketAction::Keep if more_input => SocketAction::KeepReading { writing: false },
            SocketAction::KeepWriting if more_input => SocketAction::KeepReading { writing: true },
            action => action,
        }
    }

    /// 读到 WouldBlock 或用完本次读取配额为止，每次读取一个池化数据包
    fn read_available(&self, connection: &Arc<Connection>, socket: &mut RawSocket) -> ReadOutcome {
        let mut reads = 0;
        while reads < self.config.max_reads_per_event {
            let mut packet = self.handle.new_packet();
            let platform = &self.platform;
            match packet.fill_with(self.config.max_read_size, |buf| platform.read(socket, buf)) {
                Ok(0) => return ReadOutcome::Closed(CloseReason::Normal),
                Ok(n) => {
                    reads += 1;
                    connection.record_received(n);
                    self.handle.record_received(n);
                    self.handle.packet_received(connection.clone(), packet);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Closed(CloseReason::Error(e.to_string())),
            }
        }
        ReadOutcome::BudgetExhausted
    }

    fn flush(&self, connection: &Arc<Connection>, socket: &mut RawSocket) -> SocketAction {
        loop {
            while let Some(chunk) = connection.peek_outbound() {
                match self.platform.write(socket, &chunk) {
                    Ok(0) => return SocketAction::Remove(CloseReason::Error("socket accepted no data".into())),
                    Ok(n) => {
                        connection.consume_outbound(n);
                        connection.record_sent(n);
                        self.handle.record_sent(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SocketAction::KeepWriting,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return SocketAction::Remove(CloseReason::Error(e.to_string())),
                }
            }
            if connection.close_after_flush_due() {
                return SocketAction::Remove(CloseReason::Normal);
            }
            if !connection.finish_flush() {
                return SocketAction::Keep;
            }
        }
    }

    fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .entries
            .lock()
            .values()
            .filter_map(|entry| match entry {
                SocketEntry::Stream(connection) => Some(connection.clone()),
                SocketEntry::Listener { .. } => None,
            })
            .collect();
        tracing::debug!(system = %self.name(), count = connections.len(), "disconnecting all");
        for connection in connections {
            connection.disconnect();
        }
    }

    /// 停止全部工作线程并关闭所有套接字；可重复调用
    fn clean_up(&self) {
        let workers = {
            let mut workers = self.workers.lock();
            if self.cleaned.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *workers)
        };

        self.disconnect_all();
        for mut multiplexer in workers {
            multiplexer.stop(self);
        }

        // 仍在解析地址的连接没有多路复用器
        let leftovers: Vec<SocketEntry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in leftovers {
            if let SocketEntry::Stream(connection) = entry {
                if connection.mark_dropped(CloseReason::Forced) {
                    self.handle.connection_dropped(connection);
                }
            }
        }
        tracing::info!(system = %self.name(), "socket system cleaned up");
    }
}

impl ReadinessHandler for SystemShared {
    fn on_ready(&self, id: ConnectionId, socket: &mut RawSocket, readiness: Readiness) -> SocketAction {
        let entry = self.entries.lock().get(&id).cloned();
        match entry {
            Some(SocketEntry::Listener { listener, descriptor, .. }) => {
                self.accept_pending(socket, &listener, &descriptor);
                SocketAction::Keep
            }
            Some(SocketEntry::Stream(connection)) => self.service_stream(&connection, socket, readiness),
            None => SocketAction::Remove(CloseReason::Normal),
        }
    }

    fn is_expired(&self, id: ConnectionId, idle: Duration) -> bool {
        match self.entries.lock().get(&id) {
            Some(SocketEntry::Stream(connection)) => match connection.state() {
                ConnectionState::Connecting => idle >= self.config.connect_timeout(),
                _ => self.config.idle_timeout().is_some_and(|timeout| idle >= timeout),
            },
            _ => false,
        }
    }

    fn on_removed(&self, id: ConnectionId, socket: RawSocket, reason: CloseReason) {
        self.platform.close(socket);
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(SocketEntry::Stream(connection)) => {
                if connection.mark_dropped(reason.clone()) {
                    tracing::debug!(%id, %reason, "connection closed");
                    self.handle.connection_dropped(connection);
                }
            }
            Some(SocketEntry::Listener { addr, .. }) => {
                tracing::info!(system = %self.name(), %addr, %reason, "listener closed");
            }
            None => {}
        }
    }
}
