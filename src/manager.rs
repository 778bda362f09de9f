//! 连接编排器
//!
//! - 按名称注册传输系统，并按描述符路由 `listen`/`connect`
//! - 传输系统从任意线程调用 `ManagerHandle` 入队事件
//! - `update` 在调用者线程上按到达顺序处理事件：维护已建立/已掉线集合、
//!   触发回调、统计带宽

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::ManagerConfig;
use crate::connection::{ConnectCallback, Connection, DisconnectCallback};
use crate::descriptor::ConnectionDescriptor;
use crate::error::TransportError;
use crate::event::{IncomingConnectionListener, NetworkEvent, NetworkEventListener, PendingEvent};
use crate::packet::{Packet, PacketPool};
use crate::stats::{BandwidthCounters, BandwidthMeter, BandwidthSnapshot};
use crate::system::TransportSystem;
use crate::{ConnectionId, Result};

/// 传输系统持有的编排器句柄
///
/// 所有方法线程安全，只做入队/计数，不产生可见副作用。
#[derive(Clone)]
pub struct ManagerHandle {
    events: Sender<PendingEvent>,
    pool: PacketPool,
    bandwidth: Arc<BandwidthCounters>,
    connection_buffer_size: Arc<AtomicUsize>,
}

impl ManagerHandle {
    pub fn connection_established(&self, connection: Arc<Connection>) {
        self.push(PendingEvent::Established(connection));
    }

    pub fn connection_incoming(&self, connection: Arc<Connection>, listener: Arc<dyn IncomingConnectionListener>) {
        self.push(PendingEvent::Incoming { connection, listener });
    }

    /// 报告掉线；调用者应已通过 `Connection::mark_dropped` 赢得掉线权
    pub fn connection_dropped(&self, connection: Arc<Connection>) {
        self.push(PendingEvent::Dropped(connection));
    }

    pub fn packet_received(&self, connection: Arc<Connection>, packet: Packet) {
        self.push(PendingEvent::Packet { connection, packet });
    }

    /// 从数据包池获取一个空数据包
    pub fn new_packet(&self) -> Packet {
        self.pool.acquire()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.pool_size()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bandwidth.record_sent(bytes);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bandwidth.record_received(bytes);
    }

    /// 新连接的发送缓冲上限
    pub fn new_connection_buffer_size(&self) -> usize {
        self.connection_buffer_size.load(Ordering::Relaxed)
    }

    fn push(&self, event: PendingEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("network manager gone, event discarded");
        }
    }
}

/// 插入有序、按ID索引的连接集合
///
/// `items` 保持插入顺序，`index` 记录每个ID在 `items` 中的位置；两者在每次
/// 修改时同步更新。
#[derive(Default)]
pub struct ConnectionSet {
    items: Vec<Arc<Connection>>,
    index: HashMap<ConnectionId, usize>,
}

impl ConnectionSet {
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    /// 插入；已存在时返回 false
    pub fn insert(&mut self, connection: Arc<Connection>) -> bool {
        if self.index.contains_key(&connection.id()) {
            return false;
        }
        self.index.insert(connection.id(), self.items.len());
        self.items.push(connection);
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let position = self.index.remove(&id)?;
        let removed = self.items.remove(position);
        for item in &self.items[position..] {
            if let Some(slot) = self.index.get_mut(&item.id()) {
                *slot -= 1;
            }
        }
        debug_assert_eq!(self.items.len(), self.index.len());
        Some(removed)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.index.get(&id).map(|&i| &self.items[i])
    }

    pub fn retain<F: FnMut(&Arc<Connection>) -> bool>(&mut self, mut keep: F) {
        self.items.retain(|c| keep(c));
        self.index = self.items.iter().enumerate().map(|(i, c)| (c.id(), i)).collect();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.items.iter()
    }
}

#[derive(Default)]
struct ConnectionSets {
    established: ConnectionSet,
    dropped: ConnectionSet,
}

#[derive(Default)]
struct SystemRegistry {
    systems: Vec<Arc<dyn TransportSystem>>,
    default: Option<String>,
}

impl SystemRegistry {
    fn find(&self, name: &str) -> Option<Arc<dyn TransportSystem>> {
        self.systems.iter().find(|s| s.name() == name).cloned()
    }
}

/// 连接编排器
pub struct NetworkManager {
    config: ManagerConfig,
    handle: ManagerHandle,
    events: Receiver<PendingEvent>,
    registry: RwLock<SystemRegistry>,
    sets: Mutex<ConnectionSets>,
    event_listeners: Mutex<Vec<(String, Arc<dyn NetworkEventListener>)>>,
    meter: Mutex<BandwidthMeter>,
    started: AtomicBool,
}

impl NetworkManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = ManagerHandle {
            events: sender,
            pool: PacketPool::new(config.packet_pool_size, config.packet_buffer_size),
            bandwidth: Arc::new(BandwidthCounters::default()),
            connection_buffer_size: Arc::new(AtomicUsize::new(config.new_connection_buffer_size)),
        };

        Ok(Self {
            config,
            handle,
            events: receiver,
            registry: RwLock::new(SystemRegistry::default()),
            sets: Mutex::new(ConnectionSets::default()),
            event_listeners: Mutex::new(Vec::new()),
            meter: Mutex::new(BandwidthMeter::default()),
            started: AtomicBool::new(false),
        })
    }

    /// 传输系统构造时需要的句柄
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ---- 传输系统管理 ----

    /// 安装传输系统；第一个安装的系统或 `make_default` 为真时成为默认系统
    pub fn install_system(&self, system: Arc<dyn TransportSystem>, make_default: bool) -> Result<()> {
        let name = system.name().to_string();
        if self.registry.read().find(&name).is_some() {
            return Err(TransportError::DuplicateSystem { name });
        }

        system.initialise()?;
        if self.started.load(Ordering::Acquire) {
            if let Err(e) = system.start() {
                system.clean_up();
                return Err(e);
            }
        }

        let mut registry = self.registry.write();
        if registry.find(&name).is_some() {
            drop(registry);
            system.clean_up();
            return Err(TransportError::DuplicateSystem { name });
        }
        if make_default || registry.default.is_none() {
            registry.default = Some(name.clone());
        }
        registry.systems.push(system);
        drop(registry);

        tracing::info!(system = %name, default = make_default, "transport system installed");
        Ok(())
    }

    /// 卸载传输系统：断开全部连接，投递掉线通知，然后清理
    pub fn uninstall_system(&self, name: &str) -> Result<()> {
        let system = {
            let mut registry = self.registry.write();
            let position = registry
                .systems
                .iter()
                .position(|s| s.name() == name)
                .ok_or_else(|| TransportError::unknown_system(name))?;
            if registry.default.as_deref() == Some(name) {
                registry.default = None;
            }
            registry.systems.remove(position)
        };

        system.disconnect_all();
        self.update(Duration::ZERO);
        system.clean_up();
        self.update(Duration::ZERO);

        tracing::info!(system = %name, "transport system uninstalled");
        Ok(())
    }

    pub fn uninstall_all_systems(&self) {
        let names: Vec<String> = self.registry.read().systems.iter().map(|s| s.name().to_string()).collect();
        for name in names {
            if let Err(e) = self.uninstall_system(&name) {
                tracing::warn!(system = %name, error = %e, "uninstall failed");
            }
        }
    }

    pub fn installed_system(&self, name: &str) -> Option<Arc<dyn TransportSystem>> {
        self.registry.read().find(name)
    }

    pub fn default_system(&self) -> Option<Arc<dyn TransportSystem>> {
        let registry = self.registry.read();
        registry.default.as_deref().and_then(|name| registry.find(name))
    }

    pub fn system_names(&self) -> Vec<String> {
        self.registry.read().systems.iter().map(|s| s.name().to_string()).collect()
    }

    /// 启动所有已安装系统；之后安装的系统会立即启动
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let systems = self.registry.read().systems.clone();
        for system in systems {
            system.start()?;
        }
        tracing::info!("network manager started");
        Ok(())
    }

    /// 卸载所有系统
    pub fn stop(&self) {
        self.uninstall_all_systems();
        self.started.store(false, Ordering::Release);
        tracing::info!("network manager stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn resolve_system(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn TransportSystem>> {
        match descriptor.system() {
            Some(name) => self.installed_system(name).ok_or_else(|| TransportError::unknown_system(name)),
            None => self.default_system().ok_or_else(|| TransportError::unknown_system("<default>")),
        }
    }

    // ---- 连接 ----

    /// 在描述符上开始监听；不阻塞
    pub fn listen(&self, descriptor: &str, listener: Arc<dyn IncomingConnectionListener>) -> Result<()> {
        let descriptor = ConnectionDescriptor::parse(descriptor)?;
        let system = self.resolve_system(&descriptor)?;
        system.listen(&descriptor, listener)
    }

    /// 开始连接；立即返回 Connecting 状态的连接，结果在后续 `update` 中通知
    pub fn connect(&self, descriptor: &str) -> Result<Arc<Connection>> {
        self.connect_inner(descriptor, None, None)
    }

    /// 带连接/断开回调的 `connect`
    ///
    /// `on_connect(connection, success)` 在连接建立或失败时调用一次；
    /// `on_disconnect` 仅在已建立的连接掉线时调用。
    pub fn connect_with<C, D>(&self, descriptor: &str, on_connect: C, on_disconnect: D) -> Result<Arc<Connection>>
    where
        C: Fn(&Arc<Connection>, bool) + Send + Sync + 'static,
        D: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.connect_inner(descriptor, Some(Arc::new(on_connect)), Some(Arc::new(on_disconnect)))
    }

    fn connect_inner(
        &self,
        descriptor: &str,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Arc<Connection>> {
        let descriptor = ConnectionDescriptor::parse(descriptor)?;
        let system = self.resolve_system(&descriptor)?;
        let connection = system.connect(&descriptor, on_connect, on_disconnect)?;
        tracing::debug!(id = %connection.id(), descriptor = %descriptor, "connect started");
        Ok(connection)
    }

    // ---- 事件监听 ----

    pub fn add_event_listener(&self, identifier: &str, listener: Arc<dyn NetworkEventListener>) {
        let mut listeners = self.event_listeners.lock();
        match listeners.iter_mut().find(|(id, _)| id == identifier) {
            Some(entry) => entry.1 = listener,
            None => listeners.push((identifier.to_string(), listener)),
        }
    }

    pub fn remove_event_listener(&self, identifier: &str) -> bool {
        let mut listeners = self.event_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| id != identifier);
        listeners.len() != before
    }

    // ---- 更新 ----

    /// 处理自上次调用以来排队的全部事件，必须始终在同一线程调用
    pub fn update(&self, elapsed: Duration) {
        // 只剩集合自身持有的掉线连接不再需要
        self.sets.lock().dropped.retain(|c| Arc::strong_count(c) > 1);

        let queued = self.events.len();
        let budget = self.config.max_events_per_update.map_or(queued, |max| max.min(queued));
        for _ in 0..budget {
            match self.events.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }

        if self.meter.lock().advance(elapsed, &self.handle.bandwidth) {
            let snapshot = self.bandwidth();
            tracing::trace!(
                sent_per_second = snapshot.sent_per_second,
                received_per_second = snapshot.received_per_second,
                "bandwidth updated"
            );
        }
    }

    fn dispatch(&self, event: PendingEvent) {
        match event {
            PendingEvent::Established(connection) => {
                if !self.track_established(&connection) {
                    return;
                }
                tracing::debug!(id = %connection.id(), "connection established");
                connection.notify_connect(true);
                self.broadcast(&NetworkEvent::Established(&connection));
            }
            PendingEvent::Incoming { connection, listener } => {
                if !self.track_established(&connection) {
                    return;
                }
                tracing::debug!(id = %connection.id(), peer = ?connection.remote_addr(), "incoming connection");
                listener.incoming_connection(&connection);
                self.broadcast(&NetworkEvent::IncomingConnection(&connection));
            }
            PendingEvent::Packet { connection, packet } => {
                if self.sets.lock().dropped.contains(connection.id()) {
                    return;
                }
                connection.notify_packet(&packet);
                self.broadcast(&NetworkEvent::PacketReceived(&connection, &packet));
            }
            PendingEvent::Dropped(connection) => {
                let was_established = {
                    let mut sets = self.sets.lock();
                    if sets.dropped.contains(connection.id()) {
                        return;
                    }
                    let was_established = sets.established.remove(connection.id()).is_some();
                    sets.dropped.insert(connection.clone());
                    was_established
                };

                if was_established {
                    tracing::debug!(id = %connection.id(), reason = ?connection.close_reason(), "connection dropped");
                    connection.notify_dropped();
                    self.broadcast(&NetworkEvent::Disconnected(&connection));
                } else {
                    tracing::debug!(id = %connection.id(), reason = ?connection.close_reason(), "connect failed");
                    connection.notify_connect(false);
                    self.broadcast(&NetworkEvent::ConnectFailed(&connection));
                }
                connection.release();
            }
        }
    }

    /// 移入已建立集合；重复或已掉线时返回 false
    fn track_established(&self, connection: &Arc<Connection>) -> bool {
        let mut sets = self.sets.lock();
        if sets.dropped.contains(connection.id()) {
            return false;
        }
        sets.established.insert(connection.clone())
    }

    fn broadcast(&self, event: &NetworkEvent<'_>) {
        let kind = event.kind();
        let listeners: Vec<Arc<dyn NetworkEventListener>> = self
            .event_listeners
            .lock()
            .iter()
            .filter(|(_, l)| l.interested_in(kind))
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.on_network_event(event);
        }
    }

    // ---- 查询 ----

    pub fn established_connections(&self) -> Vec<Arc<Connection>> {
        self.sets.lock().established.iter().cloned().collect()
    }

    /// 已掉线但仍被外部持有的连接
    pub fn dropped_connections(&self) -> Vec<Arc<Connection>> {
        self.sets.lock().dropped.iter().cloned().collect()
    }

    pub fn is_established(&self, id: ConnectionId) -> bool {
        self.sets.lock().established.contains(id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let sets = self.sets.lock();
        sets.established.get(id).or_else(|| sets.dropped.get(id)).cloned()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.handle.bandwidth.total_sent()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.handle.bandwidth.total_received()
    }

    pub fn bytes_sent_per_second(&self) -> u64 {
        self.meter.lock().sent_per_second()
    }

    pub fn bytes_received_per_second(&self) -> u64 {
        self.meter.lock().received_per_second()
    }

    pub fn bandwidth(&self) -> BandwidthSnapshot {
        BandwidthSnapshot::capture(&self.handle.bandwidth, &self.meter.lock())
    }

    /// 设置之后创建的连接的发送缓冲上限
    pub fn set_new_connection_buffer_size(&self, size: usize) {
        self.handle.connection_buffer_size.store(size, Ordering::Relaxed);
    }

    pub fn new_connection_buffer_size(&self) -> usize {
        self.handle.new_connection_buffer_size()
    }

    pub fn packet_pool(&self) -> &PacketPool {
        &self.handle.pool
    }

    pub fn pool_size(&self) -> usize {
        self.handle.pool_size()
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.uninstall_all_systems();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CONNECT_CALLBACK_ID;
    use crate::error::CloseReason;
    use crate::event::NetworkEventKind;
    use std::sync::atomic::AtomicUsize;

    /// 不做任何 I/O 的传输系统，测试直接通过句柄注入事件
    struct FakeSystem {
        name: String,
        handle: ManagerHandle,
        fail_initialise: bool,
        listeners: Mutex<Vec<Arc<dyn IncomingConnectionListener>>>,
        connections: Mutex<Vec<Arc<Connection>>>,
        cleaned: AtomicBool,
        started: AtomicBool,
    }

    impl FakeSystem {
        fn new(name: &str, manager: &NetworkManager) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                handle: manager.handle(),
                fail_initialise: false,
                listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                cleaned: AtomicBool::new(false),
                started: AtomicBool::new(false),
            })
        }

        fn accept(&self) -> Arc<Connection> {
            let descriptor = ConnectionDescriptor::parse("direct:10.0.0.9:port=1").unwrap();
            let connection = Arc::new(Connection::incoming(ConnectionId::next(), self.name.as_str(), descriptor, 1024));
            let listener = self.listeners.lock()[0].clone();
            self.connections.lock().push(connection.clone());
            self.handle.connection_incoming(connection.clone(), listener);
            connection
        }

        fn drop_connection(&self, connection: &Arc<Connection>, reason: CloseReason) {
            self.connections.lock().retain(|c| c.id() != connection.id());
            if connection.mark_dropped(reason) {
                self.handle.connection_dropped(connection.clone());
            }
        }
    }

    impl TransportSystem for FakeSystem {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialise(&self) -> Result<()> {
            if self.fail_initialise {
                return Err(TransportError::config_error("fake", "initialise failed"));
            }
            Ok(())
        }

        fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn clean_up(&self) {
            self.cleaned.store(true, Ordering::SeqCst);
        }

        fn disconnect_all(&self) {
            let connections: Vec<Arc<Connection>> = self.connections.lock().drain(..).collect();
            for connection in connections {
                self.drop_connection(&connection, CloseReason::Normal);
            }
        }

        fn supported_kinds(&self) -> &[&'static str] {
            &["direct"]
        }

        fn listen(&self, descriptor: &ConnectionDescriptor, listener: Arc<dyn IncomingConnectionListener>) -> Result<()> {
            if descriptor.kind() != "direct" {
                return Err(TransportError::unsupported(self.name.as_str(), descriptor.kind()));
            }
            self.listeners.lock().push(listener);
            Ok(())
        }

        fn connect(
            &self,
            descriptor: &ConnectionDescriptor,
            on_connect: Option<ConnectCallback>,
            on_disconnect: Option<DisconnectCallback>,
        ) -> Result<Arc<Connection>> {
            let connection = Arc::new(Connection::outgoing(
                ConnectionId::next(),
                self.name.as_str(),
                descriptor.clone(),
                self.handle.new_connection_buffer_size(),
            ));
            if let Some(cb) = on_connect {
                connection.add_shared_connect_callback(CONNECT_CALLBACK_ID, cb);
            }
            if let Some(cb) = on_disconnect {
                connection.add_shared_disconnect_callback(CONNECT_CALLBACK_ID, cb);
            }
            self.connections.lock().push(connection.clone());
            Ok(connection)
        }
    }

    #[derive(Default)]
    struct Recorder {
        connects: Mutex<Vec<bool>>,
        disconnects: AtomicUsize,
        packets: Mutex<Vec<Vec<u8>>>,
    }

    fn manager() -> NetworkManager {
        NetworkManager::new(ManagerConfig::default().with_packet_pool_size(4)).unwrap()
    }

    fn connect_recorded(manager: &NetworkManager, descriptor: &str) -> (Arc<Connection>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (r1, r2) = (recorder.clone(), recorder.clone());
        let connection = manager
            .connect_with(
                descriptor,
                move |_, ok| r1.connects.lock().push(ok),
                move |_| {
                    r2.disconnects.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        let r3 = recorder.clone();
        connection.add_packet_callback("test", move |_, packet| r3.packets.lock().push(packet.to_vec()));
        (connection, recorder)
    }

    fn packet(manager: &NetworkManager, bytes: &[u8]) -> Packet {
        let mut packet = manager.handle().new_packet();
        packet.extend_from_slice(bytes);
        packet
    }

    #[test]
    fn test_install_and_default_selection() {
        let manager = manager();
        let a = FakeSystem::new("A", &manager);
        let b = FakeSystem::new("B", &manager);

        manager.install_system(a.clone(), false).unwrap();
        assert_eq!(manager.default_system().unwrap().name(), "A");

        let err = manager.install_system(FakeSystem::new("A", &manager), true).unwrap_err();
        assert_eq!(err, TransportError::DuplicateSystem { name: "A".into() });
        assert_eq!(manager.default_system().unwrap().name(), "A");

        manager.install_system(b.clone(), true).unwrap();
        assert_eq!(manager.default_system().unwrap().name(), "B");
        assert_eq!(manager.system_names(), vec!["A".to_string(), "B".to_string()]);
        assert!(manager.installed_system("A").is_some());
        assert!(manager.installed_system("C").is_none());
    }

    #[test]
    fn test_install_fails_when_initialise_fails() {
        let manager = manager();
        let system = Arc::new(FakeSystem {
            fail_initialise: true,
            ..Arc::try_unwrap(FakeSystem::new("Broken", &manager)).ok().unwrap()
        });
        assert!(manager.install_system(system, true).is_err());
        assert!(manager.installed_system("Broken").is_none());
        assert!(manager.default_system().is_none());
    }

    #[test]
    fn test_start_reaches_systems() {
        let manager = manager();
        let a = FakeSystem::new("A", &manager);
        manager.install_system(a.clone(), true).unwrap();
        assert!(!a.started.load(Ordering::SeqCst));
        manager.start().unwrap();
        assert!(a.started.load(Ordering::SeqCst));

        let b = FakeSystem::new("B", &manager);
        manager.install_system(b.clone(), false).unwrap();
        assert!(b.started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_connect_routing_errors() {
        let manager = manager();
        let err = manager.connect("direct:127.0.0.1:port=1").unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_SYSTEM");

        manager.install_system(FakeSystem::new("A", &manager), true).unwrap();
        assert_eq!(manager.connect("direct").unwrap_err().error_code(), "DESCRIPTOR_ERROR");
        assert_eq!(
            manager.connect("(Nope)direct:127.0.0.1:port=1").unwrap_err(),
            TransportError::unknown_system("Nope")
        );

        let listener: Arc<dyn IncomingConnectionListener> = Arc::new(|_: &Arc<Connection>| {});
        assert_eq!(
            manager.listen("(A)passive:ANY:port=1", listener).unwrap_err().error_code(),
            "UNSUPPORTED"
        );

        let connection = manager.connect("(A)direct:127.0.0.1:port=1").unwrap();
        assert_eq!(connection.system(), "A");
    }

    #[test]
    fn test_notifications_only_inside_update_and_in_order() {
        let manager = manager();
        let system = FakeSystem::new("A", &manager);
        manager.install_system(system.clone(), true).unwrap();

        let (connection, recorder) = connect_recorded(&manager, "direct:127.0.0.1:port=9000");
        assert!(connection.mark_connected());
        let handle = manager.handle();
        handle.connection_established(connection.clone());
        handle.packet_received(connection.clone(), packet(&manager, b"one"));
        handle.packet_received(connection.clone(), packet(&manager, b"two"));

        assert!(recorder.connects.lock().is_empty());
        assert!(!manager.is_established(connection.id()));

        manager.update(Duration::from_millis(16));
        assert_eq!(*recorder.connects.lock(), vec![true]);
        assert_eq!(*recorder.packets.lock(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(manager.is_established(connection.id()));

        system.drop_connection(&connection, CloseReason::Normal);
        system.drop_connection(&connection, CloseReason::Forced);
        manager.update(Duration::from_millis(16));
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.connects.lock(), vec![true]);
        assert!(!manager.is_established(connection.id()));
        assert_eq!(connection.close_reason(), Some(CloseReason::Normal));
        assert_eq!(manager.packet_pool().stats().in_use, 0);
    }

    #[test]
    fn test_duplicate_dropped_event_is_delivered_once() {
        let manager = manager();
        manager.install_system(FakeSystem::new("A", &manager), true).unwrap();
        let (connection, recorder) = connect_recorded(&manager, "direct:127.0.0.1:port=9000");
        connection.mark_connected();

        let handle = manager.handle();
        handle.connection_established(connection.clone());
        handle.connection_established(connection.clone());
        connection.mark_dropped(CloseReason::Timeout);
        handle.connection_dropped(connection.clone());
        handle.connection_dropped(connection.clone());
        manager.update(Duration::ZERO);

        assert_eq!(*recorder.connects.lock(), vec![true]);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);

        // Late events for a connection already reported as dropped are ignored.
        handle.connection_established(connection.clone());
        handle.packet_received(connection.clone(), packet(&manager, b"late"));
        manager.update(Duration::ZERO);
        assert!(!manager.is_established(connection.id()));
        assert!(recorder.packets.lock().is_empty());
    }

    #[test]
    fn test_failed_connect_reports_connect_false() {
        let manager = manager();
        let system = FakeSystem::new("A", &manager);
        manager.install_system(system.clone(), true).unwrap();
        let (connection, recorder) = connect_recorded(&manager, "direct:192.0.2.1:port=9");

        system.drop_connection(&connection, CloseReason::Timeout);
        manager.update(Duration::ZERO);

        assert_eq!(*recorder.connects.lock(), vec![false]);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 0);
        assert!(recorder.packets.lock().is_empty());
        assert_eq!(manager.dropped_connections().len(), 1);

        // Once the caller lets go the dropped set forgets the connection.
        drop(connection);
        manager.update(Duration::ZERO);
        assert!(manager.dropped_connections().is_empty());
    }

    #[test]
    fn test_incoming_then_dropped() {
        let manager = manager();
        let system = FakeSystem::new("A", &manager);
        manager.install_system(system.clone(), true).unwrap();

        let accepted = Arc::new(Mutex::new(Vec::<Arc<Connection>>::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (acc, dis) = (accepted.clone(), disconnects.clone());
        let listener: Arc<dyn IncomingConnectionListener> = Arc::new(move |c: &Arc<Connection>| {
            let dis = dis.clone();
            c.add_disconnect_callback("server", move |_| {
                dis.fetch_add(1, Ordering::SeqCst);
            });
            acc.lock().push(c.clone());
        });
        manager.listen("direct:ANY:port=9000", listener).unwrap();

        let connection = system.accept();
        manager.update(Duration::ZERO);
        assert_eq!(accepted.lock().len(), 1);
        assert_eq!(manager.established_connections().len(), 1);

        system.drop_connection(&connection, CloseReason::Normal);
        manager.update(Duration::ZERO);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.established_connections().is_empty());
    }

    #[test]
    fn test_uninstall_drains_and_cleans_up() {
        let manager = manager();
        let system = FakeSystem::new("A", &manager);
        manager.install_system(system.clone(), true).unwrap();
        let (connection, recorder) = connect_recorded(&manager, "direct:127.0.0.1:port=9000");
        connection.mark_connected();
        manager.handle().connection_established(connection.clone());
        manager.update(Duration::ZERO);

        manager.uninstall_system("A").unwrap();
        assert!(system.cleaned.load(Ordering::SeqCst));
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.default_system().is_none());
        assert_eq!(manager.uninstall_system("A").unwrap_err().error_code(), "UNKNOWN_SYSTEM");
    }

    #[test]
    fn test_event_listeners() {
        struct Kinds(Mutex<Vec<NetworkEventKind>>);
        impl NetworkEventListener for Kinds {
            fn on_network_event(&self, event: &NetworkEvent<'_>) {
                self.0.lock().push(event.kind());
            }
            fn interested_in(&self, kind: NetworkEventKind) -> bool {
                kind != NetworkEventKind::PacketReceived
            }
        }

        let manager = manager();
        let system = FakeSystem::new("A", &manager);
        manager.install_system(system.clone(), true).unwrap();
        let kinds = Arc::new(Kinds(Mutex::new(Vec::new())));
        manager.add_event_listener("kinds", kinds.clone());

        let (connection, _) = connect_recorded(&manager, "direct:127.0.0.1:port=9000");
        connection.mark_connected();
        let handle = manager.handle();
        handle.connection_established(connection.clone());
        handle.packet_received(connection.clone(), packet(&manager, b"x"));
        system.drop_connection(&connection, CloseReason::Normal);
        manager.update(Duration::ZERO);
        assert_eq!(
            *kinds.0.lock(),
            vec![NetworkEventKind::Established, NetworkEventKind::Disconnected]
        );

        assert!(manager.remove_event_listener("kinds"));
        assert!(!manager.remove_event_listener("kinds"));
    }

    #[test]
    fn test_bandwidth_and_buffer_size() {
        let manager = manager();
        let handle = manager.handle();
        handle.record_sent(2048);
        handle.record_received(512);
        manager.update(Duration::from_millis(400));
        assert_eq!(manager.bytes_sent_per_second(), 0);
        manager.update(Duration::from_millis(600));
        assert_eq!(manager.bytes_sent_per_second(), 2048);
        assert_eq!(manager.bytes_received_per_second(), 512);
        assert_eq!(manager.total_bytes_sent(), 2048);

        manager.set_new_connection_buffer_size(64);
        assert_eq!(handle.new_connection_buffer_size(), 64);
    }

    #[test]
    fn test_update_budget() {
        let manager =
            NetworkManager::new(ManagerConfig::default().with_packet_pool_size(1).with_max_events_per_update(Some(1))).unwrap();
        manager.install_system(FakeSystem::new("A", &manager), true).unwrap();
        let (connection, recorder) = connect_recorded(&manager, "direct:127.0.0.1:port=9000");
        connection.mark_connected();
        let handle = manager.handle();
        handle.connection_established(connection.clone());
        handle.packet_received(connection.clone(), packet(&manager, b"a"));

        manager.update(Duration::ZERO);
        assert_eq!(recorder.connects.lock().len(), 1);
        assert!(recorder.packets.lock().is_empty());
        manager.update(Duration::ZERO);
        assert_eq!(recorder.packets.lock().len(), 1);
    }

    #[test]
    fn test_connection_set_keeps_views_in_sync() {
        let mut set = ConnectionSet::default();
        let connections: Vec<Arc<Connection>> = (0..5)
            .map(|i| {
                let descriptor = ConnectionDescriptor::parse(&format!("direct:10.0.0.{}:port=1", i)).unwrap();
                Arc::new(Connection::outgoing(ConnectionId::next(), "A", descriptor, 16))
            })
            .collect();
        for c in &connections {
            assert!(set.insert(c.clone()));
        }
        assert!(!set.insert(connections[0].clone()));

        set.remove(connections[1].id()).unwrap();
        set.remove(connections[3].id()).unwrap();
        assert!(set.remove(connections[3].id()).is_none());

        let order: Vec<ConnectionId> = set.iter().map(|c| c.id()).collect();
        assert_eq!(order, vec![connections[0].id(), connections[2].id(), connections[4].id()]);
        for c in [&connections[0], &connections[2], &connections[4]] {
            assert_eq!(set.get(c.id()).unwrap().id(), c.id());
        }

        set.retain(|c| c.id() != connections[0].id());
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(connections[4].id()).unwrap().id(), connections[4].id());
    }
}
