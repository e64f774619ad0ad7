use jukebox_sync::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, AppContext, GroupEvent, HttpFileDownloadTask, Task,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Jukebox Sync v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let ctx = AppContext::new(config)?;
    let events = ctx.downloads.subscribe();
    let reporter = tokio::spawn(report_events(events));

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        warn!("没有需要下载的地址，用法: jukebox-sync <url>...");
        return Ok(());
    }

    let mut tasks = Vec::with_capacity(urls.len());
    for url in &urls {
        match ctx.downloads.create_download_task(url, None) {
            Ok(task) => tasks.push(task),
            Err(e) => error!("无法创建下载任务: {}, 错误: {}", url, e),
        }
    }
    if tasks.is_empty() {
        return Ok(());
    }
    ctx.downloads.queue_downloads(&tasks)?;
    info!("已加入 {} 个下载任务", tasks.len());

    tokio::select! {
        _ = ctx.downloads.group().wait_idle() => {
            info!("所有下载任务已结束");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号，停止下载...");
        }
    }

    ctx.shutdown().await;
    reporter.abort();

    for task in &tasks {
        let status = task.status();
        info!(
            "{} -> {:?}: {} ({} bytes)",
            status.url, status.local_path, status.state, status.total_bytes_received
        );
    }
    Ok(())
}

async fn report_events(mut events: mpsc::UnboundedReceiver<GroupEvent<HttpFileDownloadTask>>) {
    while let Some(event) = events.recv().await {
        match event {
            GroupEvent::TaskStarted(task) => info!("开始下载: {}", task.core().name()),
            GroupEvent::TaskCompleted { task, outcome } => match outcome.error() {
                Some(e) => error!("下载失败: {}, 错误: {:#}", task.core().name(), e),
                None => info!("下载结束: {} ({})", task.core().name(), outcome.state()),
            },
            GroupEvent::StatusChanged(status) => info!(
                "下载状态: 运行 {}, 剩余 {}, 完成 {}, 速率 {} B/s",
                status.running,
                status.remaining,
                status.completed,
                status.transfer_rate.unwrap_or(0)
            ),
            _ => {}
        }
    }
}
