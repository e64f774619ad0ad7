use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 下载失败分类，供界面层展示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    /// 没有本地文件的访问权限
    UnauthorizedFileAccess,
    /// 本地文件无法打开（被占用等）
    SharingViolation,
    /// 服务器或网络错误
    HttpError,
    Unknown,
}

/// 下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("无权访问本地文件 {path:?}: {source}")]
    UnauthorizedFileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("无法打开本地文件 {path:?}: {source}")]
    FileUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP 状态异常 {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("等待服务器响应超时 ({0:?})")]
    Timeout(Duration),

    #[error("网络传输失败: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("写入本地文件失败: {0}")]
    Io(#[from] io::Error),

    #[error("文件大小不一致: 期望 {expected} 字节，实际 {actual} 字节")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("无效的下载地址: {0}")]
    InvalidUrl(String),
}

impl DownloadError {
    /// 打开本地文件失败时按错误类型归类
    pub fn from_open(path: PathBuf, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            DownloadError::UnauthorizedFileAccess { path, source }
        } else {
            DownloadError::FileUnavailable { path, source }
        }
    }

    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            DownloadError::UnauthorizedFileAccess { .. } => DownloadErrorKind::UnauthorizedFileAccess,
            DownloadError::FileUnavailable { .. } => DownloadErrorKind::SharingViolation,
            DownloadError::HttpStatus { .. }
            | DownloadError::Timeout(_)
            | DownloadError::Transport(_)
            | DownloadError::SizeMismatch { .. } => DownloadErrorKind::HttpError,
            DownloadError::Io(_) | DownloadError::InvalidUrl(_) => DownloadErrorKind::Unknown,
        }
    }

    /// 本地文件是否已经打开过（决定失败时要不要删除部分文件）
    pub(crate) fn after_open(&self) -> bool {
        !matches!(
            self,
            DownloadError::UnauthorizedFileAccess { .. } | DownloadError::FileUnavailable { .. }
        )
    }
}
