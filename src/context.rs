// 应用上下文

use crate::config::AppConfig;
use crate::dap::{DapSync, DeviceTrackSet, LibrarySource};
use crate::downloader::HttpDownloadManager;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 应用上下文，显式传递给需要它的组件
#[derive(Clone)]
pub struct AppContext {
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
    /// 下载管理器
    pub downloads: Arc<HttpDownloadManager>,
    /// 已连接设备的同步协调器（device_id -> DapSync）
    devices: Arc<DashMap<String, Arc<DapSync>>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        config.download.validate()?;
        let downloads = Arc::new(HttpDownloadManager::new(&config.download)?);
        Ok(Self::with_downloads(config, downloads))
    }

    pub fn with_downloads(config: AppConfig, downloads: Arc<HttpDownloadManager>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            downloads,
            devices: Arc::new(DashMap::new()),
        }
    }

    /// 注册新连接的设备，同一设备重复注册时替换旧的协调器
    pub async fn register_device(
        &self,
        device: Arc<dyn DeviceTrackSet>,
        libraries: Vec<Arc<dyn LibrarySource>>,
    ) -> Arc<DapSync> {
        let sync_config = self.config.read().await.sync.clone();
        let device_id = device.id().to_string();
        let sync = DapSync::new(device, libraries, &sync_config);
        if self.devices.insert(device_id.clone(), sync.clone()).is_some() {
            info!("设备重新注册: {}", device_id);
        } else {
            info!("设备已注册: {}", device_id);
        }
        sync
    }

    pub fn device_sync(&self, device_id: &str) -> Option<Arc<DapSync>> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn remove_device(&self, device_id: &str) -> Option<Arc<DapSync>> {
        let removed = self.devices.remove(device_id).map(|(_, sync)| sync);
        if removed.is_some() {
            info!("设备已移除: {}", device_id);
        }
        removed
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 关闭下载管理器
    pub async fn shutdown(&self) {
        self.downloads.shutdown().await;
    }
}
