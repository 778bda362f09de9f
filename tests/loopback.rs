//! 回环端到端测试
//!
//! 两个编排器各装一个直连套接字系统，通过 127.0.0.1 互连，
//! 交替调用 `update` 直到观察到预期事件。

use netplex::{
    CloseReason, Connection, ConnectionId, ConnectionState, IncomingConnectionListener, ManagerConfig, NetworkEvent,
    NetworkEventKind, NetworkEventListener, NetworkManager, SocketSystem, SocketSystemConfig, TransportSystem,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn socket_config() -> SocketSystemConfig {
    SocketSystemConfig::default()
        .with_poll_timeout(Duration::from_millis(10))
        .with_sweep_interval(Duration::from_millis(20))
}

fn manager_with(config: SocketSystemConfig) -> (NetworkManager, Arc<SocketSystem>) {
    let manager = NetworkManager::new(ManagerConfig::default().with_packet_pool_size(16)).unwrap();
    let system = Arc::new(SocketSystem::new(manager.handle(), config).unwrap());
    manager.install_system(system.clone(), true).unwrap();
    manager.start().unwrap();
    (manager, system)
}

fn pump_until<F: Fn() -> bool>(managers: &[&NetworkManager], condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        for manager in managers {
            manager.update(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// 服务端：记录接入的连接、收到的字节和掉线次数
#[derive(Default)]
struct Server {
    accepted: Mutex<Vec<Arc<Connection>>>,
    received: Arc<Mutex<Vec<u8>>>,
    disconnects: Arc<AtomicUsize>,
}

impl IncomingConnectionListener for Server {
    fn incoming_connection(&self, connection: &Arc<Connection>) {
        let received = self.received.clone();
        connection.add_packet_callback("server", move |_, packet| received.lock().extend_from_slice(packet));
        let disconnects = self.disconnects.clone();
        connection.add_disconnect_callback("server", move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
        self.accepted.lock().push(connection.clone());
    }
}

#[derive(Default)]
struct Client {
    connects: Mutex<Vec<bool>>,
    disconnects: AtomicUsize,
    received: Mutex<Vec<u8>>,
}

fn connect_client(manager: &NetworkManager, port: u16) -> (Arc<Connection>, Arc<Client>) {
    let client = Arc::new(Client::default());
    let (c1, c2) = (client.clone(), client.clone());
    let connection = manager
        .connect_with(
            &format!("direct:127.0.0.1:port={}", port),
            move |_, ok| c1.connects.lock().push(ok),
            move |_| {
                c2.disconnects.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    let c3 = client.clone();
    connection.add_packet_callback("client", move |_, packet| c3.received.lock().extend_from_slice(packet));
    (connection, client)
}

fn listening(manager: &NetworkManager, system: &SocketSystem, descriptor: &str) -> (Arc<Server>, u16) {
    let server = Arc::new(Server::default());
    manager.listen(descriptor, server.clone()).unwrap();
    let port = system.listener_addresses().last().unwrap().port();
    (server, port)
}

#[test]
fn test_connect_send_and_receive_in_order() {
    init_tracing();
    let (server_manager, server_system) = manager_with(socket_config());
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:ANY:port=0");

    let (connection, client) = connect_client(&client_manager, port);
    assert_eq!(connection.state(), ConnectionState::Connecting);
    // Queued before the connection completes, flushed once it does.
    connection.send(&b"hello "[..]).unwrap();

    let managers = [&server_manager, &client_manager];
    pump_until(&managers, || !client.connects.lock().is_empty() && server.accepted.lock().len() == 1);
    assert_eq!(*client.connects.lock(), vec![true]);
    assert!(connection.is_connected());
    assert!(client_manager.is_established(connection.id()));

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    connection.send(payload.clone()).unwrap();
    let expected_len = 6 + payload.len();
    pump_until(&managers, || server.received.lock().len() >= expected_len);

    let received = server.received.lock().clone();
    assert_eq!(received.len(), expected_len);
    assert_eq!(&received[..6], b"hello ");
    assert_eq!(&received[6..], &payload[..]);
    assert_eq!(connection.bytes_sent(), expected_len as u64);
    assert_eq!(client_manager.total_bytes_sent(), expected_len as u64);

    let accepted = server.accepted.lock()[0].clone();
    assert_eq!(accepted.remote_addr(), connection.local_addr());
    accepted.send(&b"pong"[..]).unwrap();
    pump_until(&managers, || client.received.lock().len() == 4);
    assert_eq!(*client.received.lock(), b"pong".to_vec());
}

#[test]
fn test_refused_connect_reports_failure() {
    init_tracing();
    let (manager, _system) = manager_with(socket_config());
    let port = {
        let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        scratch.local_addr().unwrap().port()
    };

    let (connection, client) = connect_client(&manager, port);
    pump_until(&[&manager], || !client.connects.lock().is_empty());

    assert_eq!(*client.connects.lock(), vec![false]);
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 0);
    assert!(client.received.lock().is_empty());
    assert!(connection.is_dropped());
    assert!(!connection.was_established());
    assert!(connection.close_reason().is_some());
}

#[test]
fn test_disconnect_is_delivered_once_on_both_sides() {
    init_tracing();
    let (server_manager, server_system) = manager_with(socket_config());
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "passive:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (connection, client) = connect_client(&client_manager, port);
    pump_until(&managers, || !client.connects.lock().is_empty() && server.accepted.lock().len() == 1);

    connection.disconnect();
    connection.disconnect();
    assert!(connection.send(&b"late"[..]).is_err());
    pump_until(&managers, || {
        client.disconnects.load(Ordering::SeqCst) == 1 && server.disconnects.load(Ordering::SeqCst) == 1
    });

    for _ in 0..10 {
        server_manager.update(Duration::from_millis(5));
        client_manager.update(Duration::from_millis(5));
    }
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(connection.close_reason(), Some(netplex::CloseReason::Normal));
    assert!(server_manager.established_connections().is_empty());
}

#[test]
fn test_disconnect_after_flush_delivers_everything() {
    init_tracing();
    let (server_manager, server_system) = manager_with(socket_config());
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (_connection, client) = connect_client(&client_manager, port);
    pump_until(&managers, || server.accepted.lock().len() == 1);

    let accepted = server.accepted.lock()[0].clone();
    let payload = vec![7u8; 64 * 1024];
    accepted.send(payload.clone()).unwrap();
    accepted.disconnect_after_flush();
    assert!(accepted.send(&b"more"[..]).is_err());

    pump_until(&managers, || client.disconnects.load(Ordering::SeqCst) == 1);
    assert_eq!(*client.received.lock(), payload);
}

#[test]
fn test_connections_spread_across_threads() {
    init_tracing();
    let (server_manager, server_system) = manager_with(socket_config().with_max_sockets_per_thread(2));
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let clients: Vec<_> = (0..5).map(|_| connect_client(&client_manager, port)).collect();
    pump_until(&managers, || server.accepted.lock().len() == clients.len());

    assert!(server_system.thread_count() >= 3);
    assert!(server_system.sockets_per_thread().iter().all(|&count| count <= 2));
    assert_eq!(server_system.connection_count(), clients.len());
}

#[test]
fn test_uninstall_drops_live_connections() {
    init_tracing();
    let (server_manager, server_system) = manager_with(socket_config());
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (_connection, client) = connect_client(&client_manager, port);
    pump_until(&managers, || !client.connects.lock().is_empty() && server.accepted.lock().len() == 1);

    server_manager.uninstall_system(server_system.name()).unwrap();
    assert_eq!(server.disconnects.load(Ordering::SeqCst), 1);
    assert!(server_system.listener_addresses().is_empty());
    assert_eq!(server_system.connection_count(), 0);

    pump_until(&[&client_manager], || client.disconnects.load(Ordering::SeqCst) == 1);
}

/// 按顺序记录广播的事件
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<(NetworkEventKind, ConnectionId)>>,
}

impl NetworkEventListener for EventLog {
    fn on_network_event(&self, event: &NetworkEvent<'_>) {
        self.events.lock().push((event.kind(), event.connection().id()));
    }
}

#[test]
fn test_incoming_precedes_packets_on_another_thread() {
    init_tracing();
    // the listener fills the first multiplexer, so accepted sockets land on a second one
    let (server_manager, server_system) = manager_with(socket_config().with_max_sockets_per_thread(1));
    let (client_manager, _client_system) = manager_with(socket_config());
    let log = Arc::new(EventLog::default());
    server_manager.add_event_listener("log", log.clone());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (connection, _client) = connect_client(&client_manager, port);
    connection.send(&b"hello"[..]).unwrap();
    pump_until(&managers, || server.received.lock().len() >= 5);

    assert_eq!(*server.received.lock(), b"hello".to_vec());
    assert_eq!(server_system.thread_count(), 2);
    let events = log.events.lock().clone();
    let id = server.accepted.lock()[0].id();
    let incoming = events.iter().position(|e| *e == (NetworkEventKind::IncomingConnection, id)).unwrap();
    let first_packet = events.iter().position(|e| *e == (NetworkEventKind::PacketReceived, id)).unwrap();
    assert!(incoming < first_packet);
}

#[test]
fn test_rejected_incoming_is_announced_then_dropped() {
    init_tracing();
    // one thread with one slot: the listener takes it and accepted sockets have nowhere to go
    let config = socket_config().with_max_threads(1).with_max_sockets_per_thread(1);
    let (server_manager, server_system) = manager_with(config);
    let (client_manager, _client_system) = manager_with(socket_config());
    let log = Arc::new(EventLog::default());
    server_manager.add_event_listener("log", log.clone());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (_connection, client) = connect_client(&client_manager, port);
    pump_until(&managers, || server.disconnects.load(Ordering::SeqCst) == 1);

    let accepted = server.accepted.lock()[0].clone();
    assert!(matches!(accepted.close_reason(), Some(CloseReason::Error(_))));
    let kinds: Vec<NetworkEventKind> = log.events.lock().iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, vec![NetworkEventKind::IncomingConnection, NetworkEventKind::Disconnected]);
    assert_eq!(server_system.connection_count(), 0);

    pump_until(&[&client_manager], || {
        client.disconnects.load(Ordering::SeqCst) == 1 || client.connects.lock().contains(&false)
    });
}

#[test]
fn test_unanswered_connect_times_out() {
    init_tracing();
    const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
    const SWEEP: Duration = Duration::from_millis(20);

    // a listener that never accepts, with its backlog filled, leaves further SYNs unanswered
    let backlog = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
    backlog.bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into()).unwrap();
    backlog.listen(0).unwrap();
    let addr = backlog.local_addr().unwrap().as_socket().unwrap();
    let mut fillers = Vec::new();
    for _ in 0..16 {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100)) {
            Ok(stream) => fillers.push(stream),
            Err(_) => break,
        }
    }

    let config = socket_config().with_connect_timeout(CONNECT_TIMEOUT).with_sweep_interval(SWEEP);
    let (manager, _system) = manager_with(config);
    let started = Instant::now();
    let (connection, client) = connect_client(&manager, addr.port());
    pump_until(&[&manager], || !client.connects.lock().is_empty());
    let elapsed = started.elapsed();

    assert_eq!(*client.connects.lock(), vec![false]);
    assert_eq!(connection.close_reason(), Some(CloseReason::Timeout));
    assert!(elapsed >= CONNECT_TIMEOUT);
    // sweep granularity plus scheduling slack
    assert!(elapsed < CONNECT_TIMEOUT + SWEEP + Duration::from_millis(500), "took {:?}", elapsed);
}

#[test]
fn test_idle_connection_times_out() {
    init_tracing();
    const IDLE_TIMEOUT: Duration = Duration::from_millis(200);
    let (server_manager, server_system) = manager_with(socket_config().with_idle_timeout(Some(IDLE_TIMEOUT)));
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let started = Instant::now();
    let (_connection, client) = connect_client(&client_manager, port);
    pump_until(&managers, || {
        server.disconnects.load(Ordering::SeqCst) == 1 && client.disconnects.load(Ordering::SeqCst) == 1
    });

    assert!(started.elapsed() >= IDLE_TIMEOUT);
    assert_eq!(server.accepted.lock()[0].close_reason(), Some(CloseReason::Timeout));
    assert_eq!(*client.connects.lock(), vec![true]);
}

#[test]
fn test_flooding_peer_does_not_starve_its_neighbour() {
    init_tracing();
    // one small read per readiness event; the rest must be picked up on later loop iterations
    let config = socket_config().with_max_reads_per_event(1).with_max_read_size(1024);
    let (server_manager, server_system) = manager_with(config);
    let (client_manager, _client_system) = manager_with(socket_config());
    let (server, port) = listening(&server_manager, &server_system, "direct:127.0.0.1:port=0");
    let managers = [&server_manager, &client_manager];

    let (flooder, _) = connect_client(&client_manager, port);
    let (quiet, _) = connect_client(&client_manager, port);
    pump_until(&managers, || server.accepted.lock().len() == 2);
    assert_eq!(server_system.thread_count(), 1);

    let flood = vec![0x5Au8; 1024 * 1024];
    flooder.send(flood.clone()).unwrap();
    quiet.send(&b"ping"[..]).unwrap();

    let expected = flood.len() + 4;
    pump_until(&managers, || server.received.lock().len() >= expected);
    let received = server.received.lock().clone();
    assert_eq!(received.len(), expected);
    assert_eq!(received.iter().filter(|&&b| b == 0x5A).count(), flood.len());
    assert_eq!(&received.iter().filter(|&&b| b != 0x5A).copied().collect::<Vec<u8>>()[..], b"ping");
}
