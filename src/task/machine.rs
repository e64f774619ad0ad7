//! 任务状态机
//!
//! `TaskCore` 保存任务的身份、状态、进度与取消请求，所有修改都在同一把锁内完成；
//! 具体任务实现 `Task` trait，只需要提供 `run`。
//!
//! 状态流转：Idle → Busy → {Completed | Failed | Paused | Stopped | Aborted}，
//! Paused 恢复后回到 Idle 等待再次执行。每次执行恰好产生一个终态通知。

use super::error::TaskError;
use super::events::{NoticeKind, TaskNotice};
use super::state::{CancellationType, RunOutcome, TaskOutcome, TaskState};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 取消请求的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelAction {
    /// 已结束或请求不能覆盖已有请求
    Ignored,
    /// 任务未在执行，已同步结束
    CompletedNow,
    /// 已通知执行中的任务，结束由执行方完成
    Signalled,
}

struct CoreInner {
    name: String,
    state: TaskState,
    progress: u8,
    busy: bool,
    /// 进入终态（暂停不算）
    finished: bool,
    /// 本次执行已产生终态通知
    attempt_closed: bool,
    cancellation: CancellationType,
    requested: CancellationType,
    token: Option<CancellationToken>,
    group: Option<Uuid>,
    notifier: Option<mpsc::UnboundedSender<TaskNotice>>,
}

/// 任务公共状态
pub struct TaskCore {
    id: Uuid,
    user_state: Option<serde_json::Value>,
    inner: Mutex<CoreInner>,
    state_tx: watch::Sender<TaskState>,
}

impl TaskCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// 附带调用方自定义数据（例如所属播客条目）
    pub fn with_user_state(name: impl Into<String>, user_state: serde_json::Value) -> Self {
        Self::build(name.into(), Some(user_state))
    }

    fn build(name: String, user_state: Option<serde_json::Value>) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Idle);
        Self {
            id: Uuid::new_v4(),
            user_state,
            inner: Mutex::new(CoreInner {
                name,
                state: TaskState::Idle,
                progress: 0,
                busy: false,
                finished: false,
                attempt_closed: false,
                cancellation: CancellationType::None,
                requested: CancellationType::None,
                token: None,
                group: None,
                notifier: None,
            }),
            state_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.name != name {
            inner.name = name;
            self.notify(&inner, NoticeKind::Updated);
        }
    }

    pub fn user_state(&self) -> Option<&serde_json::Value> {
        self.user_state.as_ref()
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn progress(&self) -> u8 {
        self.inner.lock().progress
    }

    /// 更新进度百分比，值变化时通知所属任务组
    pub fn set_progress(&self, progress: u8) -> Result<(), TaskError> {
        if progress > 100 {
            return Err(TaskError::InvalidProgress(progress));
        }
        let mut inner = self.inner.lock();
        if inner.progress != progress {
            inner.progress = progress;
            self.notify(&inner, NoticeKind::Progress(progress));
        }
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().busy
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// 已记录但可能尚未生效的取消请求
    pub fn requested_cancellation(&self) -> CancellationType {
        self.inner.lock().requested
    }

    /// 最近一次执行实际的取消类型
    pub fn cancellation_type(&self) -> CancellationType {
        self.inner.lock().cancellation
    }

    pub fn group_id(&self) -> Option<Uuid> {
        self.inner.lock().group
    }

    /// 等待任务离开 Idle/Busy
    pub async fn wait_until_settled(&self) -> TaskState {
        let mut rx = self.state_tx.subscribe();
        let settled = match rx.wait_for(|s| s.is_settled()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    pub(crate) fn attach(
        &self,
        group: Uuid,
        notifier: mpsc::UnboundedSender<TaskNotice>,
    ) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        match inner.group {
            Some(owner) if owner != group => Err(TaskError::AlreadyGrouped(self.id)),
            _ => {
                inner.group = Some(group);
                inner.notifier = Some(notifier);
                Ok(())
            }
        }
    }

    pub(crate) fn detach(&self, group: Uuid) {
        let mut inner = self.inner.lock();
        if inner.group == Some(group) {
            inner.group = None;
            inner.notifier = None;
        }
    }

    /// Idle → Busy
    ///
    /// 已记录取消请求（暂停后未恢复）时不执行，返回 `Ok(None)`
    pub(crate) fn begin_attempt(&self) -> Result<Option<CancellationToken>, TaskError> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(TaskError::AlreadyBusy(self.id));
        }
        if inner.finished {
            return Err(TaskError::AlreadyFinished(self.id));
        }
        if inner.requested != CancellationType::None {
            return Ok(None);
        }

        let token = CancellationToken::new();
        inner.busy = true;
        inner.attempt_closed = false;
        inner.cancellation = CancellationType::None;
        inner.token = Some(token.clone());
        self.transition(&mut inner, TaskState::Busy);
        Ok(Some(token))
    }

    /// 执行方结束一次执行
    ///
    /// 本次执行已经产生过终态时返回 `None`
    pub(crate) fn complete_with<F>(&self, run: RunOutcome, on_finished: F) -> Option<TaskOutcome>
    where
        F: FnOnce(&TaskOutcome),
    {
        let mut inner = self.inner.lock();
        if inner.attempt_closed || !inner.busy {
            debug!("忽略重复的完成: task={}", self.id);
            return None;
        }

        let outcome = match run {
            RunOutcome::Finished => TaskOutcome::Succeeded,
            RunOutcome::Failed(e) => TaskOutcome::Failed(Arc::new(e)),
            RunOutcome::Cancelled => TaskOutcome::from_cancellation(inner.requested),
        };
        self.finish_locked(&mut inner, outcome.clone(), on_finished);
        Some(outcome)
    }

    /// 记录取消请求并尽可能让它生效
    pub(crate) fn request_cancel<F>(&self, kind: CancellationType, on_finished: F) -> CancelAction
    where
        F: FnOnce(&TaskOutcome),
    {
        if kind == CancellationType::None {
            return CancelAction::Ignored;
        }

        let mut inner = self.inner.lock();
        if inner.finished || !inner.requested.accepts_upgrade() {
            return CancelAction::Ignored;
        }
        if kind == CancellationType::Paused && inner.state == TaskState::Paused {
            return CancelAction::Ignored;
        }

        inner.requested = kind;
        if inner.busy {
            if let Some(token) = &inner.token {
                token.cancel();
            }
            debug!("已请求取消执行中的任务: task={}, kind={:?}", self.id, kind);
            CancelAction::Signalled
        } else {
            self.finish_locked(&mut inner, TaskOutcome::from_cancellation(kind), on_finished);
            CancelAction::CompletedNow
        }
    }

    /// Paused → Idle
    pub(crate) fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || inner.busy || inner.cancellation != CancellationType::Paused {
            return false;
        }
        inner.cancellation = CancellationType::None;
        inner.requested = CancellationType::None;
        inner.attempt_closed = false;
        self.transition(&mut inner, TaskState::Idle);
        true
    }

    fn finish_locked<F>(&self, inner: &mut CoreInner, outcome: TaskOutcome, on_finished: F)
    where
        F: FnOnce(&TaskOutcome),
    {
        inner.busy = false;
        inner.attempt_closed = true;
        inner.token = None;
        inner.cancellation = outcome.cancellation();
        if !outcome.is_paused() {
            inner.finished = true;
        }
        if matches!(outcome, TaskOutcome::Succeeded) && inner.progress != 100 {
            inner.progress = 100;
            self.notify(inner, NoticeKind::Progress(100));
        }

        on_finished(&outcome);

        match outcome.error() {
            Some(e) => warn!("任务失败: name={}, error={:#}", inner.name, e),
            None => info!("任务结束: name={}, state={}", inner.name, outcome.state()),
        }

        self.transition(inner, outcome.state());
        self.notify(inner, NoticeKind::Completed(outcome));
    }

    fn transition(&self, inner: &mut CoreInner, new: TaskState) {
        let old = inner.state;
        if old == new {
            return;
        }
        inner.state = new;
        self.state_tx.send_replace(new);
        self.notify(inner, NoticeKind::StateChanged { old, new });
    }

    fn notify(&self, inner: &CoreInner, kind: NoticeKind) {
        if let Some(tx) = &inner.notifier {
            let _ = tx.send(TaskNotice {
                task_id: self.id,
                kind,
            });
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("progress", &inner.progress)
            .finish()
    }
}

/// 可调度的异步任务
///
/// 实现方只提供 `core` 和 `run`；`run` 观察到取消令牌时应尽快返回
/// `RunOutcome::Cancelled`。
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn core(&self) -> &TaskCore;

    async fn run(&self, token: CancellationToken) -> RunOutcome;

    /// 终态确定后、通知发出前调用（持有任务锁，不要回调任务自身的状态方法）
    fn on_finished(&self, _outcome: &TaskOutcome) {}

    fn supports_pause(&self) -> bool {
        false
    }

    /// 开始执行，立即返回
    ///
    /// # 返回
    /// - `Ok(true)`: 已开始
    /// - `Ok(false)`: 存在未恢复的暂停请求，没有执行
    fn execute(self: Arc<Self>) -> Result<bool, TaskError>
    where
        Self: Sized,
    {
        let Some(token) = self.core().begin_attempt()? else {
            debug!("任务存在未处理的取消请求，跳过执行: {}", self.core().name());
            return Ok(false);
        };

        tokio::spawn(async move {
            let run = AssertUnwindSafe(self.run(token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| RunOutcome::Failed(anyhow::anyhow!("任务执行时发生 panic")));
            let task = &self;
            task.core().complete_with(run, |outcome| task.on_finished(outcome));
        });
        Ok(true)
    }

    /// 中止，丢弃部分结果
    fn cancel(&self) -> bool {
        request_cancel(self, CancellationType::Aborted)
    }

    /// 停止，保留部分结果
    fn stop(&self) -> bool {
        request_cancel(self, CancellationType::Stopped)
    }

    fn pause(&self) -> Result<bool, TaskError> {
        if !self.supports_pause() {
            return Err(TaskError::PauseUnsupported(self.core().id()));
        }
        Ok(request_cancel(self, CancellationType::Paused))
    }

    /// 恢复已暂停的任务，之后由任务组重新调度
    fn resume(&self) -> bool {
        self.core().resume()
    }
}

fn request_cancel<T: Task + ?Sized>(task: &T, kind: CancellationType) -> bool {
    task.core()
        .request_cancel(kind, |outcome| task.on_finished(outcome))
        != CancelAction::Ignored
}
