pub mod error;
pub mod group;
pub mod manager;
pub mod task;
pub mod transport;

pub use error::{DownloadError, DownloadErrorKind};
pub use group::{HttpDownloadGroup, RateSampler};
pub use manager::HttpDownloadManager;
pub use task::{DownloadOptions, DownloadStatus, HttpFileDownloadTask};
pub use transport::{DownloadRequest, HttpResponse, HttpTransport, ReqwestTransport, ResponseHead};
