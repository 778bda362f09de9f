//! 套接字多路复用器：一个工作线程轮询数量有上限的一组套接字。
//!
//! 其他线程从不直接操作轮询注册，而是在多路复用器的互斥锁下排队
//! 添加、移除和写关注的变更并唤醒工作线程。工作线程在每轮循环开头
//! 统一应用这些变更，然后等待就绪并分发给 [`ReadinessHandler`]。

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::connection::ConnectionDriver;
use crate::error::CloseReason;
use crate::socket::platform::RawSocket;
use crate::ConnectionId;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// 对端关闭了读或写方向
    pub closed: bool,
}

/// 分发就绪后多路复用器对套接字的处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAction {
    /// 继续轮询；若本次是可写事件则撤掉写关注
    Keep,
    /// 继续轮询并保持写关注
    KeepWriting,
    /// 还有未读完的数据，下一轮循环直接再分发一次，不等新的边沿
    KeepReading { writing: bool },
    Remove(CloseReason),
}

/// 工作线程回调所属传输系统
pub trait ReadinessHandler: Send + Sync {
    fn on_ready(&self, id: ConnectionId, socket: &mut RawSocket, readiness: Readiness) -> SocketAction;

    /// 空闲了 `idle` 的套接字是否应超时
    fn is_expired(&self, id: ConnectionId, idle: Duration) -> bool;

    /// 套接字已离开多路复用器，不会再被轮询
    fn on_removed(&self, id: ConnectionId, socket: RawSocket, reason: CloseReason);
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
}

struct PendingAdd {
    id: ConnectionId,
    socket: RawSocket,
    write_interest: bool,
}

#[derive(Default)]
struct PendingChanges {
    add: Vec<PendingAdd>,
    /// 工作线程注册之前就被移除的套接字
    cancelled: Vec<(ConnectionId, RawSocket)>,
    remove: Vec<ConnectionId>,
    /// 以最后一次请求为准
    write_interest: HashMap<ConnectionId, bool>,
    /// 已注册或待添加、且未待移除的成员
    members: HashSet<ConnectionId>,
    stopped: bool,
}

/// 多路复用器的线程安全部分
pub struct MultiplexerShared {
    index: usize,
    capacity: usize,
    pending: Mutex<PendingChanges>,
    waker: Waker,
    running: AtomicBool,
    active: AtomicUsize,
}

impl MultiplexerShared {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 排队等待注册；已满、已停止或已包含 `id` 时拒绝并交还套接字
    pub fn add_socket(&self, id: ConnectionId, socket: RawSocket, write_interest: bool) -> Result<(), RawSocket> {
        {
            let mut pending = self.pending.lock();
            if pending.stopped || pending.members.len() >= self.capacity || pending.members.contains(&id) {
                return Err(socket);
            }
            pending.members.insert(id);
            pending.add.push(PendingAdd {
                id,
                socket,
                write_interest,
            });
        }
        self.wake();
        Ok(())
    }

    /// 排队移除 `id`；未受管理或已在移除中时返回 false
    pub fn remove_socket(&self, id: ConnectionId) -> bool {
        {
            let mut pending = self.pending.lock();
            if !pending.members.remove(&id) {
                return false;
            }
            pending.write_interest.remove(&id);
            match pending.add.iter().position(|add| add.id == id) {
                Some(position) => {
                    let add = pending.add.remove(position);
                    pending.cancelled.push((add.id, add.socket));
                }
                None => pending.remove.push(id),
            }
        }
        self.wake();
        true
    }

    pub fn enable_write_check(&self, id: ConnectionId) -> bool {
        self.set_write_check(id, true)
    }

    pub fn disable_write_check(&self, id: ConnectionId) -> bool {
        self.set_write_check(id, false)
    }

    fn set_write_check(&self, id: ConnectionId, enabled: bool) -> bool {
        {
            let mut pending = self.pending.lock();
            if !pending.members.contains(&id) {
                return false;
            }
            pending.write_interest.insert(id, enabled);
        }
        self.wake();
        true
    }

    pub fn has_capacity(&self) -> bool {
        let pending = self.pending.lock();
        !pending.stopped && pending.members.len() < self.capacity
    }

    /// 已注册及即将注册的套接字数
    pub fn socket_count(&self) -> usize {
        self.pending.lock().members.len()
    }

    /// 当前已注册到轮询器的套接字数
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 工作线程自行移除套接字时调用
    fn forget(&self, id: ConnectionId) {
        let mut pending = self.pending.lock();
        pending.remove.retain(|r| *r != id);
        // 该 id 可能已带着新套接字重新排队
        if pending.add.iter().any(|add| add.id == id) {
            return;
        }
        pending.members.remove(&id);
        pending.write_interest.remove(&id);
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(multiplexer = self.index, error = %e, "failed to wake multiplexer");
        }
    }
}

impl ConnectionDriver for MultiplexerShared {
    fn request_write(&self, id: ConnectionId) -> bool {
        self.enable_write_check(id)
    }

    fn request_close(&self, id: ConnectionId) -> bool {
        self.remove_socket(id)
    }
}

struct Slot {
    id: ConnectionId,
    socket: RawSocket,
    write_interest: bool,
    last_activity: Instant,
}

/// 多路复用器的线程本地部分，只在工作线程上使用
struct Worker {
    poll: Poll,
    events: Events,
    ready: Vec<(usize, Readiness)>,
    /// 读取配额用完的槽位及其当时的 id
    again: Vec<(usize, ConnectionId)>,
    slots: Slab<Slot>,
    tokens: HashMap<ConnectionId, usize>,
    settings: LoopSettings,
    last_sweep: Instant,
}

impl Worker {
    fn run(&mut self, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        tracing::debug!(multiplexer = shared.index, "multiplexer loop started");
        while shared.running.load(Ordering::Acquire) {
            self.update(shared, handler);
        }
        self.shutdown(shared, handler);
        tracing::debug!(multiplexer = shared.index, "multiplexer loop stopped");
    }

    /// 一轮循环：应用变更，等待就绪并分发，必要时扫描超时
    fn update(&mut self, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        self.apply_pending(shared, handler);

        let timeout = if self.again.is_empty() {
            self.settings.poll_timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                tracing::error!(multiplexer = shared.index, error = %e, "poll failed");
                thread::sleep(self.settings.poll_timeout);
                return;
            }
        }

        let now = Instant::now();
        let mut ready = std::mem::take(&mut self.ready);
        for (key, id) in self.again.drain(..) {
            // 槽位可能已被释放并复用
            if self.slots.get(key).is_some_and(|slot| slot.id == id) {
                ready.push((
                    key,
                    Readiness {
                        readable: true,
                        ..Readiness::default()
                    },
                ));
            }
        }
        ready.extend(self.events.iter().filter(|e| e.token() != WAKE_TOKEN).map(|event| {
            let readiness = Readiness {
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                closed: event.is_read_closed() || event.is_write_closed(),
            };
            (event.token().0, readiness)
        }));
        for (key, readiness) in ready.drain(..) {
            self.dispatch(key, readiness, now, shared, handler);
        }
        self.ready = ready;

        if now.duration_since(self.last_sweep) >= self.settings.sweep_interval {
            self.sweep(now, shared, handler);
            self.last_sweep = now;
        }
    }

    fn apply_pending(&mut self, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        let (adds, cancelled, removes, write_interest) = {
            let mut pending = shared.pending.lock();
            (
                std::mem::take(&mut pending.add),
                std::mem::take(&mut pending.cancelled),
                std::mem::take(&mut pending.remove),
                std::mem::take(&mut pending.write_interest),
            )
        };

        for id in removes {
            if let Some(&key) = self.tokens.get(&id) {
                self.remove_slot(key, CloseReason::Normal, false, shared, handler);
            }
        }
        for (id, socket) in cancelled {
            handler.on_removed(id, socket, CloseReason::Normal);
        }
        for add in adds {
            self.register(add, shared, handler);
        }
        for (id, enabled) in write_interest {
            if let Some(&key) = self.tokens.get(&id) {
                // 重新注册，让已可写的套接字再报告一次
                self.set_write_interest(key, enabled, enabled);
            }
        }

        debug_assert!(self.slots.len() <= shared.capacity);
        shared.active.store(self.slots.len(), Ordering::Release);
    }

    fn register(&mut self, add: PendingAdd, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        let PendingAdd {
            id,
            mut socket,
            write_interest,
        } = add;
        let entry = self.slots.vacant_entry();
        let key = entry.key();
        let interest = if write_interest {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        if let Err(e) = self.poll.registry().register(&mut socket, Token(key), interest) {
            tracing::warn!(multiplexer = shared.index, %id, error = %e, "socket registration failed");
            shared.forget(id);
            handler.on_removed(id, socket, CloseReason::Error(e.to_string()));
            return;
        }

        entry.insert(Slot {
            id,
            socket,
            write_interest,
            last_activity: Instant::now(),
        });
        self.tokens.insert(id, key);
        tracing::trace!(multiplexer = shared.index, %id, key, "socket registered");
    }

    fn dispatch(
        &mut self,
        key: usize,
        readiness: Readiness,
        now: Instant,
        shared: &MultiplexerShared,
        handler: &dyn ReadinessHandler,
    ) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        slot.last_activity = now;

        let id = slot.id;
        match handler.on_ready(id, &mut slot.socket, readiness) {
            SocketAction::Keep => {
                if readiness.writable {
                    self.set_write_interest(key, false, false);
                }
            }
            SocketAction::KeepWriting => self.set_write_interest(key, true, false),
            SocketAction::KeepReading { writing } => {
                if writing || readiness.writable {
                    self.set_write_interest(key, writing, false);
                }
                self.again.push((key, id));
            }
            SocketAction::Remove(reason) => self.remove_slot(key, reason, true, shared, handler),
        }
    }

    fn set_write_interest(&mut self, key: usize, enabled: bool, force: bool) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if slot.write_interest == enabled && !force {
            return;
        }
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self.poll.registry().reregister(&mut slot.socket, Token(key), interest) {
            Ok(()) => slot.write_interest = enabled,
            Err(e) => tracing::warn!(id = %slot.id, error = %e, "failed to update write interest"),
        }
    }

    /// 经队列请求的移除已撤掉成员资格，此时 `forget` 为 false
    fn remove_slot(
        &mut self,
        key: usize,
        reason: CloseReason,
        forget: bool,
        shared: &MultiplexerShared,
        handler: &dyn ReadinessHandler,
    ) {
        if !self.slots.contains(key) {
            return;
        }
        let mut slot = self.slots.remove(key);
        self.tokens.remove(&slot.id);
        if let Err(e) = self.poll.registry().deregister(&mut slot.socket) {
            tracing::debug!(id = %slot.id, error = %e, "deregister failed");
        }
        if forget {
            shared.forget(slot.id);
        }
        shared.active.store(self.slots.len(), Ordering::Release);
        tracing::trace!(multiplexer = shared.index, id = %slot.id, ?reason, "socket removed");
        handler.on_removed(slot.id, slot.socket, reason);
    }

    fn sweep(&mut self, now: Instant, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| handler.is_expired(slot.id, now.duration_since(slot.last_activity)))
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            if let Some(slot) = self.slots.get(key) {
                tracing::debug!(multiplexer = shared.index, id = %slot.id, "socket timed out");
            }
            self.remove_slot(key, CloseReason::Timeout, true, shared, handler);
        }
    }

    /// 释放全部套接字，包括仍在排队的
    fn shutdown(&mut self, shared: &MultiplexerShared, handler: &dyn ReadinessHandler) {
        self.apply_pending(shared, handler);
        let keys: Vec<usize> = self.slots.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.remove_slot(key, CloseReason::Forced, true, shared, handler);
        }
    }
}

/// 多路复用器及其工作线程（启动后）
pub struct Multiplexer {
    shared: Arc<MultiplexerShared>,
    worker: Option<Worker>,
    thread: Option<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn new(index: usize, capacity: usize, settings: LoopSettings) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(MultiplexerShared {
            index,
            capacity,
            pending: Mutex::new(PendingChanges::default()),
            waker,
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
        });
        let worker = Worker {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::new(),
            again: Vec::new(),
            slots: Slab::with_capacity(capacity.min(EVENTS_CAPACITY)),
            tokens: HashMap::new(),
            settings,
            last_sweep: Instant::now(),
        };
        Ok(Self {
            shared,
            worker: Some(worker),
            thread: None,
        })
    }

    pub fn shared(&self) -> &Arc<MultiplexerShared> {
        &self.shared
    }

    pub fn is_spawned(&self) -> bool {
        self.thread.is_some()
    }

    /// 启动工作线程；`dispatch` 作为该线程默认的 tracing 订阅者
    pub fn spawn(&mut self, name: String, handler: Arc<dyn ReadinessHandler>, dispatch: tracing::Dispatch) -> io::Result<()> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        let shared = self.shared.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || worker.run(&shared, handler.as_ref()));
        });
        self.thread = Some(spawned?);
        Ok(())
    }

    /// 停止循环并经 `handler` 释放全部套接字；
    /// 从未启动的多路复用器在调用线程上释放
    pub fn stop(&mut self, handler: &dyn ReadinessHandler) {
        self.shared.pending.lock().stopped = true;
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(multiplexer = self.shared.index, "multiplexer thread panicked");
            }
        } else if let Some(mut worker) = self.worker.take() {
            worker.shutdown(&self.shared, handler);
        }
    }
}
