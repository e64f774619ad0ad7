//! 本地媒体库接口

use super::track::{MediaKind, Playlist, Track};

/// 本地媒体库（音乐、播客、视频）
pub trait LibrarySource: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn media_kind(&self) -> MediaKind;

    /// 排序值，同步时按从小到大处理
    fn order(&self) -> i32 {
        0
    }

    fn tracks(&self) -> Vec<Track>;

    fn playlists(&self) -> Vec<Playlist> {
        Vec::new()
    }

    fn playlist_tracks(&self, name: &str) -> Option<Vec<Track>> {
        self.playlists()
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.tracks)
    }

    fn supports_playlists(&self) -> bool {
        false
    }
}
