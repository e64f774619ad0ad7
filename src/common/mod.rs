//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod rate_limiter;
mod throttle;

pub use rate_limiter::RateLimiter;
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
