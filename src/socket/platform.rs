//! 原始套接字操作
//!
//! 上层只通过 [`SocketPlatform`] 操作套接字。默认的 [`MioPlatform`]
//! 使用 mio 的非阻塞 TCP 类型；监听套接字先用 socket2 配置再交给 mio。
//! 就绪轮询本身是 mio 的 `Poll`（底层为 epoll/kqueue/IOCP）。

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

/// 多路复用器槽位持有的非阻塞套接字
#[derive(Debug)]
pub enum RawSocket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl RawSocket {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            RawSocket::Listener(listener) => listener.local_addr(),
            RawSocket::Stream(stream) => stream.local_addr(),
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, RawSocket::Listener(_))
    }
}

impl Source for RawSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            RawSocket::Listener(listener) => listener.register(registry, token, interests),
            RawSocket::Stream(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            RawSocket::Listener(listener) => listener.reregister(registry, token, interests),
            RawSocket::Stream(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            RawSocket::Listener(listener) => listener.deregister(registry),
            RawSocket::Stream(stream) => stream.deregister(registry),
        }
    }
}

fn not_a_stream() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "operation requires a stream socket")
}

fn not_a_listener() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "operation requires a listening socket")
}

/// 各操作系统的套接字原语
pub trait SocketPlatform: Send + Sync {
    /// 发起非阻塞连接，完成时以可写就绪通知
    fn connect(&self, addr: SocketAddr, nodelay: bool) -> io::Result<RawSocket>;

    /// 绑定并监听
    fn listen(&self, addr: SocketAddr, backlog: i32) -> io::Result<RawSocket>;

    /// 接受一个待处理连接；没有时返回 `WouldBlock`
    fn accept(&self, listener: &RawSocket, nodelay: bool) -> io::Result<(RawSocket, SocketAddr)>;

    fn read(&self, socket: &mut RawSocket, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, socket: &mut RawSocket, buf: &[u8]) -> io::Result<usize>;

    /// 连接结果：已连接为 `Ok(Some(peer))`，
    /// 仍在进行为 `Ok(None)`，失败为 `Err`
    fn connect_result(&self, socket: &RawSocket) -> io::Result<Option<SocketAddr>>;

    fn close(&self, socket: RawSocket);
}

/// 基于 mio 和 socket2 的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct MioPlatform;

impl SocketPlatform for MioPlatform {
    fn connect(&self, addr: SocketAddr, nodelay: bool) -> io::Result<RawSocket> {
        let stream = TcpStream::connect(addr)?;
        if nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%addr, error = %e, "set_nodelay failed on connecting socket");
            }
        }
        Ok(RawSocket::Stream(stream))
    }

    fn listen(&self, addr: SocketAddr, backlog: i32) -> io::Result<RawSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let listener: std::net::TcpListener = socket.into();
        Ok(RawSocket::Listener(TcpListener::from_std(listener)))
    }

    fn accept(&self, listener: &RawSocket, nodelay: bool) -> io::Result<(RawSocket, SocketAddr)> {
        let RawSocket::Listener(listener) = listener else {
            return Err(not_a_listener());
        };
        let (stream, peer) = listener.accept()?;
        if nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "set_nodelay failed on accepted socket");
            }
        }
        Ok((RawSocket::Stream(stream), peer))
    }

    fn read(&self, socket: &mut RawSocket, buf: &mut [u8]) -> io::Result<usize> {
        match socket {
            RawSocket::Stream(stream) => stream.read(buf),
            RawSocket::Listener(_) => Err(not_a_stream()),
        }
    }

    fn write(&self, socket: &mut RawSocket, buf: &[u8]) -> io::Result<usize> {
        match socket {
            RawSocket::Stream(stream) => stream.write(buf),
            RawSocket::Listener(_) => Err(not_a_stream()),
        }
    }

    fn connect_result(&self, socket: &RawSocket) -> io::Result<Option<SocketAddr>> {
        let RawSocket::Stream(stream) = socket else {
            return Err(not_a_stream());
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(peer) => Ok(Some(peer)),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&self, socket: RawSocket) {
        if let RawSocket::Stream(stream) = &socket {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
