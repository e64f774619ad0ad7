//! 单文件 HTTP 下载任务
//!
//! 本地已有部分文件时以追加方式打开，并从文件长度处发起 Range 请求续传。
//! 两种情况会删除部分文件后从头重下：
//! - 416（请求范围无法满足）：只重试一次，再次 416 按 HTTP 错误失败
//! - 远程文件比本地部分文件新
//!
//! 执行期间对部分文件持有排他锁，同一路径同时只有一个下载在写。
//! 暂停和停止保留部分文件，中止和失败删除部分文件。

use super::error::{DownloadError, DownloadErrorKind};
use super::transport::{DownloadRequest, HttpResponse, HttpTransport};
use crate::common::ProgressThrottler;
use crate::config::{Credentials, DownloadConfig};
use crate::task::{CancellationType, RunOutcome, Task, TaskCore, TaskOutcome, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 下载任务参数
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// 等待响应头或单个数据块的超时
    pub timeout: Duration,
    pub credentials: Option<Credentials>,
    pub progress_log_interval: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl DownloadOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            timeout: config.timeout(),
            credentials: config.credentials.clone(),
            progress_log_interval: Duration::from_millis(config.progress_throttle_ms),
        }
    }
}

/// 下载任务状态快照
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub url: String,
    pub local_path: PathBuf,
    pub state: TaskState,
    pub progress: u8,
    /// 本次执行收到的字节数
    pub bytes_received: u64,
    /// 文件总大小（未知时为 None）
    pub total_bytes: Option<u64>,
    /// 本地文件已有字节数（续传起点 + 本次收到）
    pub total_bytes_received: u64,
    /// 本次执行的平均速率（字节/秒）
    pub transfer_rate: u64,
    pub mime_type: Option<String>,
    pub http_status: Option<u16>,
    pub error_kind: Option<DownloadErrorKind>,
}

#[derive(Debug, Default)]
struct ResponseInfo {
    mime_type: Option<String>,
    http_status: Option<u16>,
    error_kind: Option<DownloadErrorKind>,
    total_bytes: Option<u64>,
    session_started: Option<Instant>,
}

/// 一次请求的结果
enum Attempt {
    Done,
    RangeNotSatisfiable,
    RemoteModified,
}

/// 提前结束下载循环的原因
enum Halt {
    Cancelled,
    Failed(DownloadError),
}

impl From<DownloadError> for Halt {
    fn from(e: DownloadError) -> Self {
        Halt::Failed(e)
    }
}

impl From<io::Error> for Halt {
    fn from(e: io::Error) -> Self {
        Halt::Failed(DownloadError::Io(e))
    }
}

/// HTTP 文件下载任务
pub struct HttpFileDownloadTask {
    core: TaskCore,
    url: String,
    local_path: PathBuf,
    transport: Arc<dyn HttpTransport>,
    options: DownloadOptions,
    info: Mutex<ResponseInfo>,
    /// 续传起点
    offset: AtomicU64,
    /// 本次执行收到的字节数
    received: AtomicU64,
    /// 累计收到的字节数，跨执行单调递增，供速率采样使用
    transferred: AtomicU64,
    throttler: ProgressThrottler,
}

impl HttpFileDownloadTask {
    pub fn new(
        core: TaskCore,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        transport: Arc<dyn HttpTransport>,
        options: DownloadOptions,
    ) -> Arc<Self> {
        let throttler = ProgressThrottler::new(options.progress_log_interval);
        Arc::new(Self {
            core,
            url: url.into(),
            local_path: local_path.into(),
            transport,
            options,
            info: Mutex::new(ResponseInfo::default()),
            offset: AtomicU64::new(0),
            received: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            throttler,
        })
    }

    pub fn remote_uri(&self) -> &str {
        &self.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn mime_type(&self) -> Option<String> {
        self.info.lock().mime_type.clone()
    }

    pub fn http_status(&self) -> Option<u16> {
        self.info.lock().http_status
    }

    pub fn error_kind(&self) -> Option<DownloadErrorKind> {
        self.info.lock().error_kind
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.info.lock().total_bytes
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.offset.load(Ordering::SeqCst) + self.bytes_received()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn transfer_rate(&self) -> u64 {
        let started = self.info.lock().session_started;
        match started {
            Some(at) => {
                let secs = at.elapsed().as_secs_f64();
                if secs > 0.0 {
                    (self.bytes_received() as f64 / secs) as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        let info = self.info.lock();
        let rate = match info.session_started {
            Some(at) if at.elapsed().as_secs_f64() > 0.0 => {
                (self.bytes_received() as f64 / at.elapsed().as_secs_f64()) as u64
            }
            _ => 0,
        };
        DownloadStatus {
            url: self.url.clone(),
            local_path: self.local_path.clone(),
            state: self.core.state(),
            progress: self.core.progress(),
            bytes_received: self.bytes_received(),
            total_bytes: info.total_bytes,
            total_bytes_received: self.total_bytes_received(),
            transfer_rate: rate,
            mime_type: info.mime_type.clone(),
            http_status: info.http_status,
            error_kind: info.error_kind,
        }
    }

    async fn download(&self, token: &CancellationToken) -> Result<(), Halt> {
        let mut range_retried = false;

        loop {
            match self.attempt(token).await? {
                Attempt::Done => return Ok(()),
                Attempt::RangeNotSatisfiable if range_retried => {
                    warn!("服务器再次返回 416，放弃下载: {}", self.url);
                    return Err(DownloadError::HttpStatus {
                        status: 416,
                        url: self.url.clone(),
                    }
                    .into());
                }
                Attempt::RangeNotSatisfiable => {
                    info!("服务器返回 416，删除部分文件后完整重试: {}", self.url);
                    range_retried = true;
                    remove_partial_file(&self.local_path).await;
                }
                Attempt::RemoteModified => {
                    // 重下时本地没有部分文件，不会再比较修改时间
                    info!("远程文件比本地部分文件新，从头下载: {}", self.url);
                    remove_partial_file(&self.local_path).await;
                }
            }
        }
    }

    async fn attempt(&self, token: &CancellationToken) -> Result<Attempt, Halt> {
        let (mut file, offset, local_modified) = self.open_local().await?;

        let request = DownloadRequest {
            url: self.url.clone(),
            range_start: (offset > 0).then_some(offset),
            credentials: self.options.credentials.clone(),
        };
        debug!(
            "发起下载请求: url={}, range_start={:?}",
            self.url, request.range_start
        );

        let mut response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Halt::Cancelled),
            sent = tokio::time::timeout(self.options.timeout, self.transport.send(&request)) => {
                sent.map_err(|_| DownloadError::Timeout(self.options.timeout))??
            }
        };

        let head = response.head().clone();
        {
            let mut info = self.info.lock();
            info.mime_type = head.content_type.clone();
            info.http_status = Some(head.status);
        }

        if head.status == 416 {
            return Ok(Attempt::RangeNotSatisfiable);
        }
        if !head.is_success() {
            return Err(DownloadError::HttpStatus {
                status: head.status,
                url: self.url.clone(),
            }
            .into());
        }
        if let (Some(local), Some(remote)) = (local_modified, head.last_modified) {
            if remote > local {
                return Ok(Attempt::RemoteModified);
            }
        }

        let mut start = offset;
        if offset > 0 && head.status != 206 {
            warn!("服务器未按 Range 返回部分内容，从头写入: {}", self.url);
            file.set_len(0).await?;
            start = 0;
        }
        self.offset.store(start, Ordering::SeqCst);
        let expected = head.content_length.map(|len| start + len);
        self.info.lock().total_bytes = expected;

        self.receive_body(&mut file, response.as_mut(), token).await?;

        file.flush().await?;
        if let Some(expected) = expected {
            let actual = file.metadata().await?.len();
            if actual != expected {
                return Err(DownloadError::SizeMismatch { expected, actual }.into());
            }
        }
        Ok(Attempt::Done)
    }

    async fn receive_body(
        &self,
        file: &mut File,
        response: &mut dyn HttpResponse,
        token: &CancellationToken,
    ) -> Result<(), Halt> {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(Halt::Cancelled);
                }
                next = tokio::time::timeout(self.options.timeout, response.chunk()) => next,
            };

            let chunk = match next {
                Ok(chunk) => chunk?,
                Err(_) => {
                    let _ = file.flush().await;
                    return Err(DownloadError::Timeout(self.options.timeout).into());
                }
            };
            let Some(bytes) = chunk else {
                break;
            };

            file.write_all(&bytes).await?;
            let n = bytes.len() as u64;
            self.received.fetch_add(n, Ordering::SeqCst);
            self.transferred.fetch_add(n, Ordering::SeqCst);
            self.report_progress();
        }
        Ok(())
    }

    fn report_progress(&self) {
        let Some(total) = self.total_bytes().filter(|t| *t > 0) else {
            return;
        };
        let done = self.total_bytes_received();
        let percent = (done.min(total) * 100 / total) as u8;
        let _ = self.core.set_progress(percent);

        if self.throttler.should_emit() {
            debug!(
                "下载进度: name={}, {}/{} bytes ({}%)",
                self.core.name(),
                done,
                total,
                percent
            );
        }
    }

    /// 打开本地文件并加排他锁，返回 (文件, 已有长度, 本地修改时间)
    async fn open_local(&self) -> Result<(File, u64, Option<DateTime<Utc>>), DownloadError> {
        let path = &self.local_path;
        let open_err = |e: io::Error| DownloadError::from_open(path.clone(), e);

        let existed = match fs::metadata(path).await {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.map_err(open_err)?;
                }
                false
            }
            Err(e) => return Err(open_err(e)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(open_err)?;

        // 锁随文件句柄释放
        let file = file.into_std().await;
        if let Err(e) = file.try_lock_exclusive() {
            warn!("部分文件正被其它下载占用: {:?}", path);
            return Err(DownloadError::FileUnavailable {
                path: path.clone(),
                source: e,
            });
        }
        let file = File::from_std(file);

        // 加锁之后再取长度
        let meta = file.metadata().await.map_err(open_err)?;
        let modified = if existed {
            debug!("续传本地文件: {:?}, 已有 {} bytes", path, meta.len());
            meta.modified().ok().map(DateTime::<Utc>::from)
        } else {
            None
        };
        Ok((file, meta.len(), modified))
    }
}

/// 删除部分文件及其所在的空目录，文件仍被其它下载锁住时跳过
async fn remove_partial_file(path: &Path) {
    if let Ok(file) = File::open(path).await {
        let file = file.into_std().await;
        if file.try_lock_exclusive().is_err() {
            debug!("部分文件正被其它下载使用，跳过删除: {:?}", path);
            return;
        }
    }

    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("已删除部分文件: {:?}", path);
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除部分文件失败: {:?}, 错误: {}", path, e),
    }
}

#[async_trait]
impl Task for HttpFileDownloadTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn run(&self, token: CancellationToken) -> RunOutcome {
        self.received.store(0, Ordering::SeqCst);
        self.throttler.reset();
        {
            let mut info = self.info.lock();
            info.error_kind = None;
            info.session_started = Some(Instant::now());
        }
        info!("开始下载: {} -> {:?}", self.url, self.local_path);

        match self.download(&token).await {
            Ok(()) => {
                info!(
                    "✅ 下载完成: {:?}, 本次收到 {} bytes",
                    self.local_path,
                    self.bytes_received()
                );
                RunOutcome::Finished
            }
            Err(Halt::Cancelled) => {
                if self.core.requested_cancellation() == CancellationType::Aborted {
                    remove_partial_file(&self.local_path).await;
                }
                RunOutcome::Cancelled
            }
            Err(Halt::Failed(e)) => {
                self.info.lock().error_kind = Some(e.kind());
                if e.after_open() {
                    remove_partial_file(&self.local_path).await;
                }
                RunOutcome::Failed(e.into())
            }
        }
    }

    /// 持有任务锁时调用，删除放到后台执行
    fn on_finished(&self, outcome: &TaskOutcome) {
        if !matches!(outcome, TaskOutcome::Aborted) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let path = self.local_path.clone();
                handle.spawn(async move { remove_partial_file(&path).await });
            }
            Err(_) => warn!("没有运行时，无法删除部分文件: {:?}", self.local_path),
        }
    }

    fn supports_pause(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for HttpFileDownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFileDownloadTask")
            .field("url", &self.url)
            .field("local_path", &self.local_path)
            .field("core", &self.core)
            .finish()
    }
}
