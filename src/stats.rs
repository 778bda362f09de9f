//! 带宽统计
//!
//! 工作线程只做原子累加；每秒速率由编排器在 `update` 中根据调用者传入的
//! 时间增量计算。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;

/// 工作线程写入的原子计数器
#[derive(Debug, Default)]
pub struct BandwidthCounters {
    total_sent: CachePadded<AtomicU64>,
    total_received: CachePadded<AtomicU64>,
    /// 当前统计窗口内的字节数，计算速率时清零
    window_sent: CachePadded<AtomicU64>,
    window_received: CachePadded<AtomicU64>,
}

impl BandwidthCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.total_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.total_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    fn take_window(&self) -> (u64, u64) {
        (
            self.window_sent.swap(0, Ordering::Relaxed),
            self.window_received.swap(0, Ordering::Relaxed),
        )
    }
}

/// 速率窗口，只在编排器线程上推进
#[derive(Debug, Default)]
pub struct BandwidthMeter {
    elapsed: Duration,
    sent_per_second: u64,
    received_per_second: u64,
}

impl BandwidthMeter {
    /// 累加时间；累计满一秒时重新计算速率并返回 true
    pub fn advance(&mut self, elapsed: Duration, counters: &BandwidthCounters) -> bool {
        self.elapsed += elapsed;
        if self.elapsed < Duration::from_secs(1) {
            return false;
        }

        let (sent, received) = counters.take_window();
        let secs = self.elapsed.as_secs_f64();
        self.sent_per_second = (sent as f64 / secs) as u64;
        self.received_per_second = (received as f64 / secs) as u64;
        self.elapsed = Duration::ZERO;
        true
    }

    pub fn sent_per_second(&self) -> u64 {
        self.sent_per_second
    }

    pub fn received_per_second(&self) -> u64 {
        self.received_per_second
    }
}

/// 带宽统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sent_per_second: u64,
    pub received_per_second: u64,
}

impl BandwidthSnapshot {
    pub(crate) fn capture(counters: &BandwidthCounters, meter: &BandwidthMeter) -> Self {
        Self {
            bytes_sent: counters.total_sent(),
            bytes_received: counters.total_received(),
            sent_per_second: meter.sent_per_second(),
            received_per_second: meter.received_per_second(),
        }
    }
}
