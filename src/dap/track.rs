//! 曲目与播放列表

use serde::{Deserialize, Serialize};
use std::fmt;

/// 媒体类型，决定曲目属于哪个媒体库
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Music,
    Podcast,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaKind::Music => "music",
            MediaKind::Podcast => "podcast",
            MediaKind::Video => "video",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// 所在媒体库或设备内的 ID，不同来源之间不可比较
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track_number: Option<u32>,
    /// 文件大小（字节）
    pub size: u64,
    /// 时长（秒）
    #[serde(default)]
    pub duration_secs: u64,
    pub media_kind: MediaKind,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, media_kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: String::new(),
            album: String::new(),
            track_number: None,
            size: 0,
            duration_secs: 0,
            media_kind,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// 跨媒体库和设备匹配同一首曲目用的键
    ///
    /// 对规范化后的元数据（去首尾空白、小写）取 md5，ID 不参与
    pub fn sync_key(&self) -> String {
        let normalize = |s: &str| s.trim().to_lowercase();
        let number = self
            .track_number
            .map(|n| n.to_string())
            .unwrap_or_default();
        let raw = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.media_kind,
            normalize(&self.artist),
            normalize(&self.album),
            normalize(&self.title),
            number
        );
        format!("{:x}", md5::compute(raw.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<Track>,
}

impl Playlist {
    pub fn new(name: impl Into<String>, tracks: Vec<Track>) -> Self {
        Self {
            name: name.into(),
            tracks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_key_ignores_id_and_case() {
        let a = Track::new("lib-1", "Blue in Green", MediaKind::Music)
            .with_artist("Miles Davis")
            .with_album("Kind of Blue");
        let b = Track::new("dev-99", "  blue in green ", MediaKind::Music)
            .with_artist("MILES DAVIS")
            .with_album("kind of blue");
        assert_eq!(a.sync_key(), b.sync_key());
    }

    #[test]
    fn test_sync_key_distinguishes_fields() {
        let a = Track::new("1", "Intro", MediaKind::Music).with_album("A");
        let b = Track::new("1", "Intro", MediaKind::Music).with_album("B");
        let c = Track::new("1", "Intro", MediaKind::Podcast).with_album("A");
        assert_ne!(a.sync_key(), b.sync_key());
        assert_ne!(a.sync_key(), c.sync_key());

        let mut numbered = a.clone();
        numbered.track_number = Some(1);
        assert_ne!(a.sync_key(), numbered.sync_key());
    }

    #[test]
    fn test_track_serde() {
        let track = Track::new("7", "Episode 7", MediaKind::Podcast).with_size(1024);
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json["media_kind"], "podcast");
        let back: Track = serde_json::from_value(json).unwrap();
        assert_eq!(back, track);
    }
}
