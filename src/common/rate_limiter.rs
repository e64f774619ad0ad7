//! 请求合并（防抖）
//!
//! 窗口期内的多次触发只执行一次：第一次触发后等待窗口结束再执行动作，
//! 等待期间和执行期间的其它触发全部被吸收，不会排队

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Shared {
    pending: AtomicBool,
    passes: AtomicU64,
}

/// 防抖执行器
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    action: Action,
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            window,
            action: Arc::new(action),
            shared: Arc::new(Shared {
                pending: AtomicBool::new(false),
                passes: AtomicU64::new(0),
            }),
        }
    }

    /// 请求执行一次
    ///
    /// # 返回
    /// - `true`: 本次触发安排了一次新的执行
    /// - `false`: 已有执行在等待或运行中，本次被合并
    pub fn execute(&self) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("不在 tokio 运行时中，忽略防抖执行请求");
                return false;
            }
        };

        if self
            .shared
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("已有待执行的请求，本次触发被合并");
            return false;
        }

        let guard = PendingGuard {
            shared: self.shared.clone(),
        };
        let window = self.window;
        let action = self.action.clone();

        handle.spawn(async move {
            tokio::time::sleep(window).await;
            action().await;
            guard.shared.passes.fetch_add(1, Ordering::SeqCst);
            drop(guard);
        });

        true
    }

    /// 是否有等待中或运行中的执行
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// 已完成的执行次数
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// 执行结束（包括 panic 展开）时清除等待标记
struct PendingGuard {
    shared: Arc<Shared>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.store(false, Ordering::SeqCst);
    }
}
