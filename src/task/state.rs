use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// 等待执行（新建或恢复后）
    Idle,
    /// 执行中
    Busy,
    /// 已暂停，可恢复
    Paused,
    /// 成功完成
    Completed,
    /// 失败
    Failed,
    /// 已停止（保留部分结果）
    Stopped,
    /// 已中止（丢弃部分结果）
    Aborted,
}

impl TaskState {
    /// 终态：不会再被执行
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Stopped | TaskState::Aborted
        )
    }

    /// 不在等待也不在执行
    pub fn is_settled(self) -> bool {
        !matches!(self, TaskState::Idle | TaskState::Busy)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Busy => "busy",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
            TaskState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// 取消类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancellationType {
    None,
    Paused,
    Stopped,
    Aborted,
}

impl CancellationType {
    /// 已记录的请求能否被新的请求覆盖
    ///
    /// 只允许从 None/Paused 升级，停止和中止请求一旦记录就不再改变
    pub(crate) fn accepts_upgrade(self) -> bool {
        matches!(self, CancellationType::None | CancellationType::Paused)
    }
}

/// 一次执行的终态结果，每次执行恰好产生一个
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded,
    Failed(Arc<anyhow::Error>),
    Paused,
    Stopped,
    Aborted,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Paused => TaskState::Paused,
            TaskOutcome::Stopped => TaskState::Stopped,
            TaskOutcome::Aborted => TaskState::Aborted,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TaskOutcome::Paused)
    }

    /// 由取消请求导致（暂停、停止、中止）
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Paused | TaskOutcome::Stopped | TaskOutcome::Aborted
        )
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskOutcome::Failed(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn from_cancellation(kind: CancellationType) -> Self {
        match kind {
            CancellationType::Paused => TaskOutcome::Paused,
            CancellationType::Aborted => TaskOutcome::Aborted,
            // 没有记录请求类型的取消（例如令牌被外部取消）按停止处理
            CancellationType::Stopped | CancellationType::None => TaskOutcome::Stopped,
        }
    }

    pub(crate) fn cancellation(&self) -> CancellationType {
        match self {
            TaskOutcome::Paused => CancellationType::Paused,
            TaskOutcome::Stopped => CancellationType::Stopped,
            TaskOutcome::Aborted => CancellationType::Aborted,
            TaskOutcome::Succeeded | TaskOutcome::Failed(_) => CancellationType::None,
        }
    }
}

impl PartialEq for TaskOutcome {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaskOutcome::Failed(a), TaskOutcome::Failed(b)) => Arc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

/// `Task::run` 的返回值
#[derive(Debug)]
pub enum RunOutcome {
    /// 工作正常结束
    Finished,
    /// 观察到取消令牌后退出
    Cancelled,
    Failed(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_state_mapping() {
        assert_eq!(TaskOutcome::Succeeded.state(), TaskState::Completed);
        assert_eq!(
            TaskOutcome::Failed(Arc::new(anyhow::anyhow!("x"))).state(),
            TaskState::Failed
        );
        assert_eq!(TaskOutcome::Paused.state(), TaskState::Paused);
        assert_eq!(
            TaskOutcome::from_cancellation(CancellationType::None),
            TaskOutcome::Stopped
        );
        assert_eq!(
            TaskOutcome::from_cancellation(CancellationType::Aborted),
            TaskOutcome::Aborted
        );
    }

    #[test]
    fn test_finished_states() {
        assert!(!TaskState::Idle.is_finished());
        assert!(!TaskState::Busy.is_finished());
        assert!(!TaskState::Paused.is_finished());
        assert!(TaskState::Paused.is_settled());
        assert!(TaskState::Stopped.is_finished());
        assert!(TaskState::Completed.is_finished());
    }

    #[test]
    fn test_cancellation_upgrade() {
        assert!(CancellationType::None.accepts_upgrade());
        assert!(CancellationType::Paused.accepts_upgrade());
        assert!(!CancellationType::Stopped.accepts_upgrade());
        assert!(!CancellationType::Aborted.accepts_upgrade());
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&TaskState::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
    }
}
