use thiserror::Error;
use uuid::Uuid;

/// 任务与任务组的误用错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("任务正在执行: {0}")]
    AlreadyBusy(Uuid),

    #[error("任务已结束，不能再次执行: {0}")]
    AlreadyFinished(Uuid),

    #[error("任务不支持暂停: {0}")]
    PauseUnsupported(Uuid),

    #[error("任务已属于其它任务组: {0}")]
    AlreadyGrouped(Uuid),

    #[error("进度超出范围: {0}")]
    InvalidProgress(u8),

    #[error("任务组正在停止，不能添加任务")]
    GroupStopping,

    #[error("重排顺序无效: {0}")]
    InvalidOrder(String),

    #[error("索引越界: {index} (长度 {len})")]
    IndexOutOfRange { index: usize, len: usize },
}
