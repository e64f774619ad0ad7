// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 设备同步配置
    #[serde(default)]
    pub sync: SyncConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// HTTP 基本认证凭据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 临时下载目录，每个 URL 在其下占用一个 md5 子目录
    #[serde(default = "default_temp_download_dir")]
    pub temp_download_dir: PathBuf,
    /// 最大同时下载文件数
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// 单次读取超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 可选的基本认证
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// 传输速率采样间隔（毫秒）
    #[serde(default = "default_rate_sample_interval_ms")]
    pub rate_sample_interval_ms: u64,
    /// 进度日志节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
}

fn default_temp_download_dir() -> PathBuf {
    std::env::temp_dir().join("jukebox-sync").join("downloads")
}

fn default_max_concurrent_downloads() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("jukebox-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_rate_sample_interval_ms() -> u64 {
    1500
}

fn default_progress_throttle_ms() -> u64 {
    crate::common::DEFAULT_THROTTLE_INTERVAL_MS
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            temp_download_dir: default_temp_download_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            credentials: None,
            rate_sample_interval_ms: default_rate_sample_interval_ms(),
            progress_throttle_ms: default_progress_throttle_ms(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_sample_interval(&self) -> Duration {
        Duration::from_millis(self.rate_sample_interval_ms)
    }

    /// 校验数值范围
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads 必须大于 0");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs 必须大于 0");
        }
        if self.rate_sample_interval_ms == 0 {
            anyhow::bail!("rate_sample_interval_ms 必须大于 0");
        }
        Ok(())
    }
}

/// 设备同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 同步请求合并窗口（毫秒），窗口内的重复触发只执行一次
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 新设备默认手动管理
    #[serde(default = "default_manually_manage")]
    pub manually_manage: bool,
    /// 新设备默认是否自动同步
    #[serde(default)]
    pub auto_sync: bool,
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_manually_manage() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            manually_manage: default_manually_manage(),
            auto_sync: false,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }
                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.max_concurrent_downloads, 2);
        assert_eq!(config.download.timeout_secs, 60);
        assert_eq!(config.download.rate_sample_interval_ms, 1500);
        assert!(config.sync.manually_manage);
        assert!(!config.sync.auto_sync);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.max_concurrent_downloads = 4;
        config.download.credentials = Some(Credentials {
            username: "guest".to_string(),
            password: None,
        });
        config.sync.debounce_ms = 250;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.max_concurrent_downloads, 4);
        assert_eq!(loaded.download.credentials, config.download.credentials);
        assert_eq!(loaded.sync.debounce_ms, 250);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_concurrent_downloads = 3

            [sync]
            auto_sync = true
            "#,
        )
        .unwrap();

        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.download.timeout_secs, 60);
        assert!(config.sync.auto_sync);
        assert!(config.sync.manually_manage);
        assert_eq!(config.log.retention_days, 7);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(path, "[download]\nmax_concurrent_downloads = 0\n").unwrap();

        assert!(AppConfig::load_from_file(path).await.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.download.max_concurrent_downloads, 2);
        assert!(std::path::Path::new(path).exists());
    }
}
