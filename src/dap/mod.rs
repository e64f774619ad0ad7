//! 便携播放器（DAP）同步
//!
//! 根据每个媒体库的同步范围，计算设备上需要添加和删除的曲目，并在防抖后执行同步

pub mod device;
pub mod error;
pub mod library_sync;
pub mod source;
pub mod sync;
pub mod track;

pub use device::DeviceTrackSet;
pub use error::SyncError;
pub use library_sync::{DapLibrarySync, SyncPlan, SyncReport, SyncScope};
pub use source::LibrarySource;
pub use sync::{DapSync, SyncEvent};
pub use track::{MediaKind, Playlist, Track};
