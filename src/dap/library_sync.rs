//! 单个媒体库到设备的同步计划

use super::device::DeviceTrackSet;
use super::error::SyncError;
use super::source::LibrarySource;
use super::track::{Playlist, Track};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 媒体库的同步范围
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// 不同步（手动管理）
    None,
    EntireLibrary,
    /// 只同步指定播放列表
    Playlist(String),
}

impl Default for SyncScope {
    fn default() -> Self {
        SyncScope::EntireLibrary
    }
}

/// 同步计划
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub to_add: Vec<Track>,
    pub to_remove: Vec<Track>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn add_bytes(&self) -> u64 {
        self.to_add.iter().map(|t| t.size).sum()
    }

    pub fn remove_bytes(&self) -> u64 {
        self.to_remove.iter().map(|t| t.size).sum()
    }
}

/// 一次同步的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    /// 空间不足跳过的曲目
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.added += other.added;
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// 单个媒体库的同步器
pub struct DapLibrarySync {
    library: Arc<dyn LibrarySource>,
    scope: Mutex<SyncScope>,
    plan: Mutex<SyncPlan>,
}

impl DapLibrarySync {
    pub fn new(library: Arc<dyn LibrarySource>, scope: SyncScope) -> Self {
        Self {
            library,
            scope: Mutex::new(scope),
            plan: Mutex::new(SyncPlan::default()),
        }
    }

    pub fn library(&self) -> &Arc<dyn LibrarySource> {
        &self.library
    }

    pub fn scope(&self) -> SyncScope {
        self.scope.lock().clone()
    }

    pub fn set_scope(&self, scope: SyncScope) {
        debug!("媒体库 {} 同步范围: {:?}", self.library.name(), scope);
        *self.scope.lock() = scope;
    }

    pub fn is_enabled(&self) -> bool {
        *self.scope.lock() != SyncScope::None
    }

    /// 最近一次计算的计划
    pub fn plan(&self) -> SyncPlan {
        self.plan.lock().clone()
    }

    /// 当前范围内应在设备上的曲目（按同步键去重）
    pub fn desired_tracks(&self) -> Vec<Track> {
        let tracks = match self.scope() {
            SyncScope::None => Vec::new(),
            SyncScope::EntireLibrary => self.library.tracks(),
            SyncScope::Playlist(name) => match self.library.playlist_tracks(&name) {
                Some(tracks) => tracks,
                None => {
                    warn!(
                        "媒体库 {} 中未找到播放列表 {}，不同步任何曲目",
                        self.library.name(),
                        name
                    );
                    Vec::new()
                }
            },
        };

        let mut seen = HashSet::new();
        tracks
            .into_iter()
            .filter(|t| seen.insert(t.sync_key()))
            .collect()
    }

    /// 需要同步到设备的播放列表
    pub fn synced_playlists(&self) -> Vec<Playlist> {
        if !self.library.supports_playlists() {
            return Vec::new();
        }
        match self.scope() {
            SyncScope::None => Vec::new(),
            SyncScope::EntireLibrary => self.library.playlists(),
            SyncScope::Playlist(name) => self
                .library
                .playlists()
                .into_iter()
                .filter(|p| p.name == name)
                .collect(),
        }
    }

    /// 根据设备上的曲目计算同步计划
    pub fn calculate_sync(&self, device_tracks: &[Track]) -> SyncPlan {
        let plan = if self.is_enabled() {
            let desired = self.desired_tracks();
            let kind = self.library.media_kind();

            let on_device: HashSet<String> = device_tracks
                .iter()
                .filter(|t| t.media_kind == kind)
                .map(Track::sync_key)
                .collect();
            let wanted: HashSet<String> = desired.iter().map(Track::sync_key).collect();

            SyncPlan {
                to_add: desired
                    .into_iter()
                    .filter(|t| !on_device.contains(&t.sync_key()))
                    .collect(),
                to_remove: device_tracks
                    .iter()
                    .filter(|t| t.media_kind == kind && !wanted.contains(&t.sync_key()))
                    .cloned()
                    .collect(),
            }
        } else {
            SyncPlan::default()
        };

        debug!(
            "同步计划: library={}, 添加 {} 首 ({} bytes), 删除 {} 首",
            self.library.name(),
            plan.to_add.len(),
            plan.add_bytes(),
            plan.to_remove.len()
        );
        *self.plan.lock() = plan.clone();
        plan
    }

    /// 执行同步：先删除，再在空间允许时添加
    pub async fn sync(&self, device: &dyn DeviceTrackSet) -> Result<SyncReport, SyncError> {
        let device_tracks = device.tracks().await?;
        let plan = self.calculate_sync(&device_tracks);
        let mut report = SyncReport::default();
        if plan.is_empty() {
            return Ok(report);
        }

        for track in &plan.to_remove {
            match device.remove_track(track).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("从设备删除曲目失败: {}, 错误: {}", track.title, e);
                    report.failed += 1;
                }
            }
        }

        let mut available = device.available_space().await?;
        for track in &plan.to_add {
            if track.size > available {
                warn!(
                    "设备空间不足，跳过曲目: {} (需要 {} bytes，剩余 {} bytes)",
                    track.title, track.size, available
                );
                report.skipped += 1;
                continue;
            }
            match device.add_track(track).await {
                Ok(()) => {
                    available -= track.size;
                    report.added += 1;
                }
                Err(e) => {
                    warn!("添加曲目到设备失败: {}, 错误: {}", track.title, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "媒体库 {} 同步完成: 添加 {}, 删除 {}, 跳过 {}, 失败 {}",
            self.library.name(),
            report.added,
            report.removed,
            report.skipped,
            report.failed
        );
        Ok(report)
    }
}

impl fmt::Debug for DapLibrarySync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DapLibrarySync")
            .field("library", &self.library.id())
            .field("scope", &self.scope())
            .finish()
    }
}
