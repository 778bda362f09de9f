//! 数据包与数据包池
//!
//! - 预分配固定大小的缓冲区，放入无锁队列
//! - 任意线程都可以获取/归还，无需加锁
//! - 池耗尽时按需增长
//! - 数据包被 drop 时自动归还，复用前清空长度

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::SegQueue;

/// 数据包池
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// 空闲缓冲区
    available: SegQueue<BytesMut>,
    /// 每个缓冲区的初始容量
    buffer_size: usize,
    stats: PacketPoolStats,
}

/// 数据包池统计
#[derive(Debug, Default)]
pub struct PacketPoolStats {
    /// 已分配缓冲区总数（池容量）
    pub allocated: AtomicUsize,
    /// 当前空闲缓冲区数
    pub available: AtomicUsize,
    /// 获取操作次数
    pub acquire_operations: AtomicU64,
    /// 归还操作次数
    pub release_operations: AtomicU64,
    /// 池耗尽后新分配的次数
    pub grow_operations: AtomicU64,
}

/// 数据包池统计快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketPoolStatsSnapshot {
    pub allocated: usize,
    pub available: usize,
    pub in_use: usize,
    pub acquire_operations: u64,
    pub release_operations: u64,
    pub grow_operations: u64,
}

impl PacketPoolStats {
    /// 获取统计快照
    pub fn snapshot(&self) -> PacketPoolStatsSnapshot {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let available = self.available.load(Ordering::Relaxed);
        PacketPoolStatsSnapshot {
            allocated,
            available,
            in_use: allocated.saturating_sub(available),
            acquire_operations: self.acquire_operations.load(Ordering::Relaxed),
            release_operations: self.release_operations.load(Ordering::Relaxed),
            grow_operations: self.grow_operations.load(Ordering::Relaxed),
        }
    }
}

impl PacketPool {
    /// 创建数据包池，预分配 `count` 个容量为 `buffer_size` 的缓冲区
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let inner = PoolInner {
            available: SegQueue::new(),
            buffer_size,
            stats: PacketPoolStats::default(),
        };
        for _ in 0..count {
            inner.available.push(BytesMut::with_capacity(buffer_size));
        }
        inner.stats.allocated.store(count, Ordering::Relaxed);
        inner.stats.available.store(count, Ordering::Relaxed);

        tracing::debug!(count, buffer_size, "packet pool preallocated");
        Self { inner: Arc::new(inner) }
    }

    /// 获取一个空数据包，池耗尽时新分配
    pub fn acquire(&self) -> Packet {
        let stats = &self.inner.stats;
        stats.acquire_operations.fetch_add(1, Ordering::Relaxed);

        let data = match self.inner.available.pop() {
            Some(data) => {
                stats.available.fetch_sub(1, Ordering::Relaxed);
                data
            }
            None => {
                stats.grow_operations.fetch_add(1, Ordering::Relaxed);
                stats.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.buffer_size)
            }
        };

        Packet {
            data,
            pool: Some(self.inner.clone()),
        }
    }

    /// 已分配缓冲区总数
    pub fn pool_size(&self) -> usize {
        self.inner.stats.allocated.load(Ordering::Relaxed)
    }

    /// 当前空闲缓冲区数
    pub fn available(&self) -> usize {
        self.inner.stats.available.load(Ordering::Relaxed)
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn stats(&self) -> PacketPoolStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

/// 数据包：一段字节，有效长度等于最后一次写入的长度
///
/// 从池中获取的数据包在 drop 时归还给池。
pub struct Packet {
    data: BytesMut,
    pool: Option<Arc<PoolInner>>,
}

impl Packet {
    /// 不属于任何池的数据包
    pub fn detached(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// 追加数据
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// 清空内容
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// 用 `fill` 写入最多 `max` 个字节，有效长度设为实际写入的字节数
    pub fn fill_with<F>(&mut self, max: usize, fill: F) -> std::io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        self.data.clear();
        self.data.resize(max, 0);
        match fill(&mut self.data[..]) {
            Ok(n) => {
                self.data.truncate(n.min(max));
                Ok(n)
            }
            Err(e) => {
                self.data.clear();
                Err(e)
            }
        }
    }

    /// 复制内容为不可变 `Bytes`，数据包本身仍会归还给池
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            pool.stats.available.fetch_add(1, Ordering::Relaxed);
            pool.available.push(data);
            pool.stats.release_operations.fetch_add(1, Ordering::Relaxed);
        }
    }
}
