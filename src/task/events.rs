//! 任务组事件
//!
//! 任务通过通知通道向所属任务组汇报变化，任务组汇总后以 `GroupEvent`
//! 的形式交给唯一的订阅者（通常是界面层）

use super::state::{TaskOutcome, TaskState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 任务发给所属任务组的通知
#[derive(Debug, Clone)]
pub(crate) struct TaskNotice {
    pub task_id: Uuid,
    pub kind: NoticeKind,
}

#[derive(Debug, Clone)]
pub(crate) enum NoticeKind {
    StateChanged { old: TaskState, new: TaskState },
    Progress(u8),
    Updated,
    Completed(TaskOutcome),
}

/// 任务组状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// 最大并发数
    pub max_running: usize,
    /// 正在执行的任务数
    pub running: usize,
    /// 尚未结束的任务数（含排队和暂停）
    pub remaining: usize,
    /// 本轮已结束的任务数（成功或失败）
    pub completed: usize,
    /// 聚合传输速率（字节/秒），只有下载任务组会填写
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_rate: Option<u64>,
}

/// 任务组事件
pub enum GroupEvent<T> {
    /// 任务组进入运行状态
    Started,
    /// 所有任务结束，任务组回到空闲
    Stopped,
    TaskAdded {
        index: usize,
        task: Arc<T>,
    },
    TaskStarted(Arc<T>),
    TaskCompleted {
        task: Arc<T>,
        outcome: TaskOutcome,
    },
    TaskStateChanged {
        task: Arc<T>,
        old: TaskState,
        new: TaskState,
    },
    TaskProgress {
        task: Arc<T>,
        progress: u8,
    },
    /// 任务名称等展示信息变化
    TaskUpdated(Arc<T>),
    /// 整体进度百分比
    Progress(u8),
    StatusChanged(GroupStatus),
    /// 排队顺序变化，`new_order[i]` 为新位置 i 上任务的旧位置
    Reordered {
        new_order: Vec<usize>,
    },
}

impl<T> GroupEvent<T> {
    /// 事件名，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            GroupEvent::Started => "started",
            GroupEvent::Stopped => "stopped",
            GroupEvent::TaskAdded { .. } => "task_added",
            GroupEvent::TaskStarted(_) => "task_started",
            GroupEvent::TaskCompleted { .. } => "task_completed",
            GroupEvent::TaskStateChanged { .. } => "task_state_changed",
            GroupEvent::TaskProgress { .. } => "task_progress",
            GroupEvent::TaskUpdated(_) => "task_updated",
            GroupEvent::Progress(_) => "progress",
            GroupEvent::StatusChanged(_) => "status_changed",
            GroupEvent::Reordered { .. } => "reordered",
        }
    }
}
