//! 进度输出节流
//!
//! 下载循环每收到一个数据块都会更新进度，日志只按固定间隔输出一次

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 基于时间间隔的节流器
///
/// 时间戳以创建时刻为零点，存成纳秒偏移，多线程共享时只做 CAS 不加锁
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次放行时刻（相对 origin 的纳秒数 + 1，0 表示从未放行）
    last_emit: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次放行超过间隔时返回 true
    pub fn should_emit(&self) -> bool {
        let now = self.now();
        let last = self.last_emit.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 并发调用时只有一个能抢到
        self.last_emit
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 无条件放行（任务结束时输出最后一次进度）
    pub fn force_emit(&self) {
        self.last_emit.store(self.now(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.last_emit.store(0, Ordering::Relaxed);
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);

        // 第一次应该放行
        assert!(throttler.should_emit());
        // 立即再次调用，不放行
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);
        assert!(throttler.should_emit());

        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_and_reset() {
        let throttler = ProgressThrottler::with_millis(1000);
        throttler.force_emit();
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_concurrent_only_one_wins() {
        let throttler = Arc::new(ProgressThrottler::with_millis(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = throttler.clone();
                thread::spawn(move || t.should_emit())
            })
            .collect();

        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|x| *x)
            .count();
        assert_eq!(emitted, 1);
    }
}
