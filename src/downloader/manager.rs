use super::error::DownloadError;
use super::group::HttpDownloadGroup;
use super::task::{DownloadOptions, HttpFileDownloadTask};
use super::transport::{HttpTransport, ReqwestTransport};
use crate::config::DownloadConfig;
use crate::task::{GroupEvent, TaskCore};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 本地文件名中不允许出现的字符
const INVALID_FILE_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// 下载管理器
///
/// 持有一个 HTTP 下载任务组和临时下载目录，负责创建并排队下载任务
pub struct HttpDownloadManager {
    group: HttpDownloadGroup,
    transport: Arc<dyn HttpTransport>,
    options: DownloadOptions,
    temp_dir: PathBuf,
    /// 🔥 关闭后不再接受新任务
    disposing: AtomicBool,
}

impl HttpDownloadManager {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let transport = Arc::new(ReqwestTransport::new(config)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: &DownloadConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, DownloadError> {
        let temp_dir = config.temp_download_dir.clone();
        std::fs::create_dir_all(&temp_dir)?;
        info!(
            "下载管理器初始化: temp_dir={:?}, max_concurrent={}",
            temp_dir, config.max_concurrent_downloads
        );

        Ok(Self {
            group: HttpDownloadGroup::new("http-downloads", config),
            transport,
            options: DownloadOptions::from_config(config),
            temp_dir,
            disposing: AtomicBool::new(false),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn group(&self) -> &HttpDownloadGroup {
        &self.group
    }

    /// 订阅下载组事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GroupEvent<HttpFileDownloadTask>> {
        self.group.subscribe()
    }

    /// 计算 URL 对应的本地临时路径：`<tmp>/<md5(url)>/<文件名>`
    pub fn local_path_for(&self, url: &str) -> Result<PathBuf, DownloadError> {
        let parsed = parse_url(url)?;
        let dir = format!("{:x}", md5::compute(url.as_bytes()));
        Ok(self
            .temp_dir
            .join(dir)
            .join(escape_file_name(last_segment(&parsed))))
    }

    /// 创建下载任务（不排队）
    pub fn create_download_task(
        &self,
        url: &str,
        user_state: Option<serde_json::Value>,
    ) -> Result<Arc<HttpFileDownloadTask>, DownloadError> {
        let parsed = parse_url(url)?;
        let local_path = self.local_path_for(url)?;

        let segment = last_segment(&parsed);
        let name = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());
        let name = if name.is_empty() {
            parsed.host_str().unwrap_or(url).to_string()
        } else {
            name
        };

        let core = match user_state {
            Some(state) => TaskCore::with_user_state(name, state),
            None => TaskCore::new(name),
        };
        Ok(HttpFileDownloadTask::new(
            core,
            url,
            local_path,
            self.transport.clone(),
            self.options.clone(),
        ))
    }

    /// 加入下载队列，关闭后返回 `Ok(false)`
    pub fn queue_download(&self, task: Arc<HttpFileDownloadTask>) -> Result<bool, crate::task::TaskError> {
        if self.is_disposing() {
            warn!("下载管理器正在关闭，忽略任务: {}", task.remote_uri());
            return Ok(false);
        }
        self.group.add(task)?;
        Ok(true)
    }

    pub fn queue_downloads(
        &self,
        tasks: &[Arc<HttpFileDownloadTask>],
    ) -> Result<bool, crate::task::TaskError> {
        if self.is_disposing() {
            warn!("下载管理器正在关闭，忽略 {} 个任务", tasks.len());
            return Ok(false);
        }
        self.group.add_all(tasks)?;
        Ok(true)
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// 停止所有下载并等待任务组空闲
    pub async fn shutdown(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("正在关闭下载管理器");
        self.group.stop();
        self.group.wait_idle().await;
        info!("下载管理器已关闭");
    }
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::InvalidUrl(format!(
            "{}: 不支持的协议 {}",
            url, other
        ))),
    }
}

fn last_segment(url: &Url) -> &str {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("")
}

fn escape_file_name(segment: &str) -> String {
    let escaped: String = segment
        .chars()
        .map(|c| {
            if INVALID_FILE_NAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    if escaped.is_empty() {
        "download".to_string()
    } else {
        escaped
    }
}
