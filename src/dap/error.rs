use thiserror::Error;

/// 设备同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("设备 {device} 操作失败: {message}")]
    Device { device: String, message: String },

    #[error("设备正在同步")]
    AlreadySyncing,

    #[error("未找到媒体库: {0}")]
    UnknownLibrary(String),
}

impl SyncError {
    pub fn device(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Device {
            device: device.into(),
            message: message.to_string(),
        }
    }
}
