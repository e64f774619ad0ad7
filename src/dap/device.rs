//! 设备曲目集合接口
//!
//! 同步逻辑只把设备看作一个可增删曲目、报告容量的集合，具体协议由实现方负责

use super::error::SyncError;
use super::track::{Playlist, Track};
use async_trait::async_trait;

#[async_trait]
pub trait DeviceTrackSet: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    async fn tracks(&self) -> Result<Vec<Track>, SyncError>;

    async fn add_track(&self, track: &Track) -> Result<(), SyncError>;

    async fn remove_track(&self, track: &Track) -> Result<(), SyncError>;

    /// 总容量（字节）
    fn capacity(&self) -> u64;

    async fn available_space(&self) -> Result<u64, SyncError>;

    fn supports_playlists(&self) -> bool {
        false
    }

    fn supports_video(&self) -> bool {
        false
    }

    fn supports_podcasts(&self) -> bool {
        true
    }

    async fn remove_playlists(&self) -> Result<(), SyncError> {
        Ok(())
    }

    /// 按媒体库的播放列表重建设备上的播放列表
    async fn sync_playlists(&self, _playlists: &[Playlist]) -> Result<(), SyncError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 内存设备，记录并发访问情况
    pub(crate) struct MemoryDevice {
        pub capacity: u64,
        pub playlists_supported: bool,
        pub video_supported: bool,
        pub podcasts_supported: bool,
        /// 每次增删曲目的耗时
        pub op_delay: Option<Duration>,
        /// 添加时失败的曲目标题
        pub fail_titles: Vec<String>,
        tracks: Mutex<Vec<Track>>,
        playlists: Mutex<Vec<String>>,
        next_id: AtomicUsize,
        pub playlist_removals: AtomicUsize,
        active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl MemoryDevice {
        pub(crate) fn new(capacity: u64) -> Self {
            Self {
                capacity,
                playlists_supported: false,
                video_supported: false,
                podcasts_supported: true,
                op_delay: None,
                fail_titles: Vec::new(),
                tracks: Mutex::new(Vec::new()),
                playlists: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(1),
                playlist_removals: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_tracks(self, tracks: Vec<Track>) -> Self {
            *self.tracks.lock() = tracks;
            self
        }

        pub(crate) fn snapshot(&self) -> Vec<Track> {
            self.tracks.lock().clone()
        }

        pub(crate) fn titles(&self) -> Vec<String> {
            let mut titles: Vec<_> = self.tracks.lock().iter().map(|t| t.title.clone()).collect();
            titles.sort();
            titles
        }

        pub(crate) fn playlist_names(&self) -> Vec<String> {
            self.playlists.lock().clone()
        }

        async fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.op_delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DeviceTrackSet for MemoryDevice {
        fn id(&self) -> &str {
            "memory-device"
        }

        fn name(&self) -> &str {
            "Memory Player"
        }

        async fn tracks(&self) -> Result<Vec<Track>, SyncError> {
            Ok(self.snapshot())
        }

        async fn add_track(&self, track: &Track) -> Result<(), SyncError> {
            self.enter().await;
            if self.fail_titles.contains(&track.title) {
                return Err(SyncError::device(self.id(), "写入失败"));
            }
            let mut copy = track.clone();
            copy.id = format!("dev-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.tracks.lock().push(copy);
            Ok(())
        }

        async fn remove_track(&self, track: &Track) -> Result<(), SyncError> {
            self.enter().await;
            self.tracks.lock().retain(|t| t.id != track.id);
            Ok(())
        }

        fn capacity(&self) -> u64 {
            self.capacity
        }

        async fn available_space(&self) -> Result<u64, SyncError> {
            let used: u64 = self.tracks.lock().iter().map(|t| t.size).sum();
            Ok(self.capacity.saturating_sub(used))
        }

        fn supports_playlists(&self) -> bool {
            self.playlists_supported
        }

        fn supports_video(&self) -> bool {
            self.video_supported
        }

        fn supports_podcasts(&self) -> bool {
            self.podcasts_supported
        }

        async fn remove_playlists(&self) -> Result<(), SyncError> {
            self.playlist_removals.fetch_add(1, Ordering::SeqCst);
            self.playlists.lock().clear();
            Ok(())
        }

        async fn sync_playlists(&self, playlists: &[Playlist]) -> Result<(), SyncError> {
            let mut names = self.playlists.lock();
            names.extend(playlists.iter().map(|p| p.name.clone()));
            Ok(())
        }
    }
}
