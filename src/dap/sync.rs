//! 设备同步协调器
//!
//! 每个已连接的设备一个 `DapSync`：
//! - `manually_manage` 为 true 时不做任何自动同步
//! - 自动同步开启时，媒体库变化会触发 `sync()`，多次触发经防抖合并为一次同步
//! - 同一时刻最多只有一次同步在执行

use super::device::DeviceTrackSet;
use super::error::SyncError;
use super::library_sync::{DapLibrarySync, SyncPlan, SyncReport, SyncScope};
use super::source::LibrarySource;
use super::track::{MediaKind, Playlist};
use crate::common::RateLimiter;
use crate::config::SyncConfig;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 设置或同步计划发生变化
    Updated,
    SyncStarted,
    SyncFinished(SyncReport),
    SyncFailed(String),
}

#[derive(Debug, Clone, Copy)]
struct SyncSettings {
    manually_manage: bool,
    auto_sync: bool,
}

/// 设备同步协调器
pub struct DapSync {
    device: Arc<dyn DeviceTrackSet>,
    library_syncs: Vec<Arc<DapLibrarySync>>,
    settings: Mutex<SyncSettings>,
    loaded: AtomicBool,
    syncing: AtomicBool,
    limiter: RateLimiter,
    events: Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>,
}

impl DapSync {
    /// 创建协调器，按设备能力过滤媒体库
    pub fn new(
        device: Arc<dyn DeviceTrackSet>,
        libraries: Vec<Arc<dyn LibrarySource>>,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let mut libraries: Vec<_> = libraries
            .into_iter()
            .filter(|lib| match lib.media_kind() {
                MediaKind::Video => device.supports_video(),
                MediaKind::Podcast => device.supports_podcasts(),
                MediaKind::Music => true,
            })
            .collect();
        libraries.sort_by_key(|lib| lib.order());

        let library_syncs = libraries
            .into_iter()
            .map(|lib| Arc::new(DapLibrarySync::new(lib, SyncScope::default())))
            .collect();

        let window = config.debounce();
        let settings = SyncSettings {
            manually_manage: config.manually_manage,
            auto_sync: config.auto_sync,
        };

        Arc::new_cyclic(|weak: &Weak<DapSync>| {
            let weak = weak.clone();
            let limiter = RateLimiter::new(window, move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.run_sync_pass().await;
                    }
                }
                .boxed()
            });

            info!("设备同步协调器已创建: device={}", device.name());
            DapSync {
                device,
                library_syncs,
                settings: Mutex::new(settings),
                loaded: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                limiter,
                events: Mutex::new(None),
            }
        })
    }

    pub fn device(&self) -> &Arc<dyn DeviceTrackSet> {
        &self.device
    }

    pub fn library_syncs(&self) -> &[Arc<DapLibrarySync>] {
        &self.library_syncs
    }

    pub fn library_sync(&self, library_id: &str) -> Option<&Arc<DapLibrarySync>> {
        self.library_syncs
            .iter()
            .find(|s| s.library().id() == library_id)
    }

    /// 订阅同步事件，新的订阅会替换旧的
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    /// 是否由同步逻辑管理设备内容
    pub fn enabled(&self) -> bool {
        !self.settings.lock().manually_manage
    }

    pub fn auto_sync(&self) -> bool {
        let settings = self.settings.lock();
        !settings.manually_manage && settings.auto_sync
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// 已执行完的同步次数
    pub fn sync_passes(&self) -> u64 {
        self.limiter.passes()
    }

    pub fn set_manually_manage(&self, manual: bool) {
        self.settings.lock().manually_manage = manual;
        info!("设备 {} 手动管理: {}", self.device.name(), manual);
        self.emit(SyncEvent::Updated);
    }

    pub fn set_auto_sync(&self, auto_sync: bool) {
        self.settings.lock().auto_sync = auto_sync;
        self.emit(SyncEvent::Updated);
        if self.auto_sync() {
            self.sync();
        }
    }

    /// 设备加载完成，开启自动同步时立即触发一次
    pub fn dap_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
        if self.auto_sync() {
            self.sync();
        }
    }

    /// 重新计算所有媒体库的同步计划
    pub async fn calculate_sync(&self) -> Result<Vec<(String, SyncPlan)>, SyncError> {
        let device_tracks = self.device.tracks().await?;
        let plans = self
            .library_syncs
            .iter()
            .map(|s| (s.library().id().to_string(), s.calculate_sync(&device_tracks)))
            .collect();
        self.emit(SyncEvent::Updated);
        Ok(plans)
    }

    /// 媒体库内容变化
    pub async fn on_library_changed(&self, library_id: &str) -> Result<(), SyncError> {
        if !self.enabled() {
            return Ok(());
        }
        let lib_sync = self
            .library_sync(library_id)
            .ok_or_else(|| SyncError::UnknownLibrary(library_id.to_string()))?;

        if self.auto_sync() {
            self.sync();
        } else {
            let device_tracks = self.device.tracks().await?;
            lib_sync.calculate_sync(&device_tracks);
            self.emit(SyncEvent::Updated);
        }
        Ok(())
    }

    /// 设备内容变化
    pub async fn on_device_changed(&self) -> Result<(), SyncError> {
        if self.auto_sync() || !self.is_loaded() || self.is_syncing() {
            return Ok(());
        }
        let device_tracks = self.device.tracks().await?;
        for lib_sync in &self.library_syncs {
            lib_sync.calculate_sync(&device_tracks);
        }
        Ok(())
    }

    /// 请求同步（经防抖合并），返回本次是否安排了新的同步
    pub fn sync(&self) -> bool {
        let scheduled = self.limiter.execute();
        if scheduled {
            debug!("已安排设备同步: {}", self.device.name());
        }
        scheduled
    }

    /// 立即执行一次同步，不经过防抖
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("设备 {} 正在同步，忽略本次请求", self.device.name());
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = SyncingGuard(&self.syncing);
        self.emit(SyncEvent::SyncStarted);
        info!("🔥 开始同步设备: {}", self.device.name());

        let sync_playlists = self.device.supports_playlists()
            && self
                .library_syncs
                .iter()
                .any(|s| s.library().supports_playlists());

        if sync_playlists {
            self.device.remove_playlists().await?;
        }

        let mut report = SyncReport::default();
        for lib_sync in &self.library_syncs {
            report.merge(lib_sync.sync(self.device.as_ref()).await?);
        }

        if sync_playlists {
            let playlists: Vec<Playlist> = self
                .library_syncs
                .iter()
                .flat_map(|s| s.synced_playlists())
                .collect();
            self.device.sync_playlists(&playlists).await?;
        }

        info!("✅ 设备同步完成: {}, {:?}", self.device.name(), report);
        Ok(report)
    }

    async fn run_sync_pass(&self) {
        match self.sync_now().await {
            Ok(report) => {
                self.emit(SyncEvent::SyncFinished(report));
                self.emit(SyncEvent::Updated);
            }
            Err(SyncError::AlreadySyncing) => {}
            Err(e) => {
                error!("设备同步失败: {}, 错误: {}", self.device.name(), e);
                self.emit(SyncEvent::SyncFailed(e.to_string()));
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::device::memory::MemoryDevice;
    use crate::dap::source::memory::MemoryLibrary;
    use crate::dap::track::Track;
    use std::time::Duration;

    fn song(id: &str, title: &str) -> Track {
        Track::new(id, title, MediaKind::Music).with_size(10)
    }

    fn config(debounce_ms: u64, manual: bool, auto: bool) -> SyncConfig {
        SyncConfig {
            debounce_ms,
            manually_manage: manual,
            auto_sync: auto,
        }
    }

    fn music() -> Arc<MemoryLibrary> {
        Arc::new(MemoryLibrary::new(
            "music",
            MediaKind::Music,
            vec![song("1", "A"), song("2", "B")],
        ))
    }

    #[tokio::test]
    async fn test_settings() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device, vec![music()], &config(10, true, true));
        assert!(!sync.enabled());
        assert!(!sync.auto_sync());

        sync.set_manually_manage(false);
        assert!(sync.enabled());
        assert!(sync.auto_sync());
    }

    #[tokio::test]
    async fn test_libraries_filtered_by_capability() {
        let device = Arc::new(MemoryDevice::new(1000));
        let video: Arc<dyn LibrarySource> =
            Arc::new(MemoryLibrary::new("video", MediaKind::Video, vec![]));
        let podcasts: Arc<dyn LibrarySource> =
            Arc::new(MemoryLibrary::new("podcasts", MediaKind::Podcast, vec![]).with_order(2));
        let music: Arc<dyn LibrarySource> =
            Arc::new(MemoryLibrary::new("music", MediaKind::Music, vec![]).with_order(1));

        let sync = DapSync::new(device, vec![video, podcasts, music], &config(10, false, false));
        let ids: Vec<_> = sync
            .library_syncs()
            .iter()
            .map(|s| s.library().id().to_string())
            .collect();
        assert_eq!(ids, vec!["music", "podcasts"]);
    }

    #[tokio::test]
    async fn test_rapid_triggers_coalesce() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device.clone(), vec![music()], &config(50, false, true));
        let mut events = sync.subscribe();

        let scheduled: Vec<bool> = (0..10).map(|_| sync.sync()).collect();
        assert_eq!(scheduled.iter().filter(|s| **s).count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sync.sync_passes(), 1);
        assert_eq!(device.titles(), vec!["A", "B"]);

        let mut started = 0;
        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SyncEvent::SyncStarted => started += 1,
                SyncEvent::SyncFinished(report) => {
                    finished += 1;
                    assert_eq!(report.added, 2);
                }
                _ => {}
            }
        }
        assert_eq!((started, finished), (1, 1));
    }

    #[tokio::test]
    async fn test_overlapping_passes_refused() {
        let mut device = MemoryDevice::new(1000);
        device.op_delay = Some(Duration::from_millis(30));
        let device = Arc::new(device);
        let sync = DapSync::new(device.clone(), vec![music()], &config(10, false, false));

        let (first, second) = tokio::join!(sync.sync_now(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(sync.is_syncing());
            sync.sync_now().await
        });

        assert_eq!(first.unwrap().added, 2);
        assert!(matches!(second, Err(SyncError::AlreadySyncing)));
        assert!(!sync.is_syncing());
        assert_eq!(device.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_library_change_recalculates_when_manual_sync() {
        let device = Arc::new(MemoryDevice::new(1000));
        let library = music();
        let sync = DapSync::new(
            device.clone(),
            vec![library.clone() as Arc<dyn LibrarySource>],
            &config(10, false, false),
        );
        let mut events = sync.subscribe();

        library.push(song("3", "C"));
        sync.on_library_changed("music").await.unwrap();
        assert_eq!(sync.library_sync("music").unwrap().plan().to_add.len(), 3);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::Updated);
        // 未开启自动同步，设备保持不变
        assert!(device.snapshot().is_empty());

        assert!(matches!(
            sync.on_library_changed("missing").await,
            Err(SyncError::UnknownLibrary(_))
        ));
    }

    #[tokio::test]
    async fn test_library_change_ignored_when_manual() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device, vec![music()], &config(10, true, false));
        let mut events = sync.subscribe();
        sync.on_library_changed("music").await.unwrap();
        assert!(events.try_recv().is_err());
        assert!(sync.library_sync("music").unwrap().plan().is_empty());
    }

    #[tokio::test]
    async fn test_device_change_requires_loaded() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device, vec![music()], &config(10, false, false));

        sync.on_device_changed().await.unwrap();
        assert!(sync.library_sync("music").unwrap().plan().is_empty());

        sync.dap_loaded();
        sync.on_device_changed().await.unwrap();
        assert_eq!(sync.library_sync("music").unwrap().plan().to_add.len(), 2);
    }

    #[tokio::test]
    async fn test_enabling_auto_sync_triggers_sync() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device.clone(), vec![music()], &config(20, false, false));
        sync.set_auto_sync(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sync.sync_passes(), 1);
        assert_eq!(device.titles(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_playlists_rewritten_when_supported() {
        let mut device = MemoryDevice::new(1000);
        device.playlists_supported = true;
        let device = Arc::new(device);
        let library: Arc<dyn LibrarySource> = Arc::new(
            MemoryLibrary::new("music", MediaKind::Music, vec![song("1", "A")])
                .with_playlist(Playlist::new("road trip", vec![song("1", "A")])),
        );
        let sync = DapSync::new(device.clone(), vec![library], &config(10, false, false));

        sync.sync_now().await.unwrap();
        assert_eq!(device.playlist_removals.load(Ordering::SeqCst), 1);
        assert_eq!(device.playlist_names(), vec!["road trip"]);
    }

    #[tokio::test]
    async fn test_playlists_untouched_without_support() {
        let device = Arc::new(MemoryDevice::new(1000));
        let sync = DapSync::new(device.clone(), vec![music()], &config(10, false, false));
        sync.sync_now().await.unwrap();
        assert_eq!(device.playlist_removals.load(Ordering::SeqCst), 0);
    }
}
