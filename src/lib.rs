// Jukebox Sync Library
// 媒体库下载与便携播放器同步核心库

// 🔥 公共模块（防抖、进度节流）
pub mod common;

// 配置管理模块
pub mod config;

// 应用上下文
pub mod context;

// 便携播放器同步模块
pub mod dap;

// 下载引擎模块
pub mod downloader;

// 日志模块
pub mod logging;

// 异步任务引擎
pub mod task;

// 导出常用类型
pub use config::AppConfig;
pub use context::AppContext;
pub use dap::{DapLibrarySync, DapSync, SyncEvent, SyncPlan, SyncScope};
pub use downloader::{DownloadError, DownloadErrorKind, HttpDownloadGroup, HttpDownloadManager, HttpFileDownloadTask};
pub use task::{GroupEvent, GroupStatus, Task, TaskGroup, TaskOutcome, TaskState};
