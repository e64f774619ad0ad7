//! 有界并发任务组
//!
//! - 添加任务后自动开始，按 FIFO 顺序提升排队任务，运行数不超过 `max_running`
//! - 任务结束（成功、失败、取消）后立即提升下一个排队任务
//! - 暂停的任务留在组内，回到队首，恢复后重新参与调度
//! - 任务通过通知通道汇报变化，由后台泵在组锁内处理，组锁内不调用任务的取消逻辑

use super::machine::Task;
use super::error::TaskError;
use super::events::{GroupEvent, GroupStatus, NoticeKind, TaskNotice};
use super::state::{TaskOutcome, TaskState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 任务组扩展点
///
/// 所有回调都在组锁内执行，不能回调任务组
pub trait GroupHooks<T>: Send + Sync {
    fn on_started(&self, _status: &mut GroupStatus) {}
    fn on_stopped(&self, _status: &mut GroupStatus) {}
    fn on_task_started(&self, _task: &Arc<T>, _status: &mut GroupStatus) {}
    fn on_task_completed(&self, _task: &Arc<T>, _outcome: &TaskOutcome, _status: &mut GroupStatus) {
    }
}

struct GroupState<T> {
    /// 排队与暂停中的任务（有序）
    queue: Vec<Arc<T>>,
    /// 执行中的任务
    current: Vec<Arc<T>>,
    members: HashMap<Uuid, Arc<T>>,
    status: GroupStatus,
    executing: bool,
    cancel_requested: bool,
    progress: u8,
    events: Option<mpsc::UnboundedSender<GroupEvent<T>>>,
}

struct GroupShared<T> {
    id: Uuid,
    name: String,
    state: Mutex<GroupState<T>>,
    notice_tx: mpsc::UnboundedSender<TaskNotice>,
    executing_tx: watch::Sender<bool>,
    hooks: Option<Arc<dyn GroupHooks<T>>>,
}

/// 任务组句柄，克隆后共享同一个组
pub struct TaskGroup<T: Task> {
    shared: Arc<GroupShared<T>>,
}

impl<T: Task> Clone for TaskGroup<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Task> TaskGroup<T> {
    /// 创建任务组并启动通知泵（需要在 tokio 运行时中调用）
    pub fn new(name: impl Into<String>, max_running: usize) -> Self {
        Self::build(name.into(), max_running, None)
    }

    pub fn with_hooks(
        name: impl Into<String>,
        max_running: usize,
        hooks: Arc<dyn GroupHooks<T>>,
    ) -> Self {
        Self::build(name.into(), max_running, Some(hooks))
    }

    fn build(name: String, max_running: usize, hooks: Option<Arc<dyn GroupHooks<T>>>) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (executing_tx, _) = watch::channel(false);
        let shared = Arc::new(GroupShared {
            id: Uuid::new_v4(),
            name,
            state: Mutex::new(GroupState {
                queue: Vec::new(),
                current: Vec::new(),
                members: HashMap::new(),
                status: GroupStatus {
                    max_running: max_running.max(1),
                    ..Default::default()
                },
                executing: false,
                cancel_requested: false,
                progress: 0,
                events: None,
            }),
            notice_tx,
            executing_tx,
            hooks,
        });

        spawn_notice_pump(Arc::downgrade(&shared), notice_rx);
        info!(
            "任务组已创建: name={}, max_running={}",
            shared.name,
            max_running.max(1)
        );
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 订阅组事件，新的订阅会替换旧的
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GroupEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().events = Some(tx);
        rx
    }

    /// 添加任务并自动开始
    pub fn add(&self, task: Arc<T>) -> Result<(), TaskError> {
        self.shared.add_locked(std::slice::from_ref(&task))?;
        self.start();
        Ok(())
    }

    /// 批量添加，遇到第一个错误即返回（之前的任务已加入）
    pub fn add_all(&self, tasks: &[Arc<T>]) -> Result<(), TaskError> {
        let result = self.shared.add_locked(tasks);
        self.start();
        result
    }

    /// 进入运行状态并提升排队任务
    ///
    /// 已在运行时只做一次调度，返回 false
    pub fn start(&self) -> bool {
        let started = {
            let mut st = self.shared.state.lock();
            if st.cancel_requested || st.members.is_empty() {
                return false;
            }
            if st.executing {
                false
            } else {
                st.executing = true;
                st.status.completed = 0;
                st.progress = 0;
                if let Some(hooks) = &self.shared.hooks {
                    hooks.on_started(&mut st.status);
                }
                self.shared.executing_tx.send_replace(true);
                info!("任务组开始执行: name={}", self.shared.name);
                emit(&st, GroupEvent::Started);
                true
            }
        };
        self.shared.dispatch();
        started
    }

    /// 停止所有任务（保留部分结果）
    pub fn stop(&self) -> bool {
        self.shared.cancel_all(false)
    }

    /// 中止所有任务（丢弃部分结果）
    pub fn cancel(&self) -> bool {
        self.shared.cancel_all(true)
    }

    /// 调整最大并发数，缩小时不抢占执行中的任务
    pub fn set_max_running(&self, max_running: usize) {
        let max_running = max_running.max(1);
        {
            let mut st = self.shared.state.lock();
            let old = st.status.max_running;
            if old == max_running {
                return;
            }
            st.status.max_running = max_running;
            info!(
                "任务组并发数调整: name={}, {} -> {}",
                self.shared.name, old, max_running
            );
            emit(&st, GroupEvent::StatusChanged(st.status.clone()));
        }
        self.shared.dispatch();
    }

    /// 重排等待队列，`new_order[i]` 为新位置 i 上任务的旧位置
    pub fn reorder(&self, new_order: &[usize]) -> Result<(), TaskError> {
        let mut st = self.shared.state.lock();
        let len = st.queue.len();
        if new_order.len() != len {
            return Err(TaskError::InvalidOrder(format!(
                "长度 {} 与队列长度 {} 不一致",
                new_order.len(),
                len
            )));
        }
        let mut seen = vec![false; len];
        for &old in new_order {
            if old >= len || seen[old] {
                return Err(TaskError::InvalidOrder(format!("不是有效的排列: {:?}", new_order)));
            }
            seen[old] = true;
        }

        let reordered: Vec<Arc<T>> = new_order.iter().map(|&i| st.queue[i].clone()).collect();
        st.queue = reordered;
        debug!("任务组队列已重排: name={}, order={:?}", self.shared.name, new_order);
        emit(
            &st,
            GroupEvent::Reordered {
                new_order: new_order.to_vec(),
            },
        );
        Ok(())
    }

    /// 把等待队列中 `src` 位置的任务移动到 `dest`
    pub fn move_task(&self, dest: usize, src: usize) -> Result<(), TaskError> {
        let len = self.shared.state.lock().queue.len();
        for index in [dest, src] {
            if index >= len {
                return Err(TaskError::IndexOutOfRange { index, len });
            }
        }
        if dest == src {
            return Ok(());
        }
        let mut order: Vec<usize> = (0..len).collect();
        let moved = order.remove(src);
        order.insert(dest, moved);
        self.reorder(&order)
    }

    /// 等待任务组回到空闲
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.executing_tx.subscribe();
        let _ = rx.wait_for(|executing| !*executing).await;
    }

    /// 在组锁内更新状态快照，闭包返回 true 时发出 StatusChanged
    pub fn refresh_status<F>(&self, f: F)
    where
        F: FnOnce(&[Arc<T>], &mut GroupStatus) -> bool,
    {
        let mut st = self.shared.state.lock();
        let st = &mut *st;
        if f(&st.current, &mut st.status) {
            emit(st, GroupEvent::StatusChanged(st.status.clone()));
        }
    }

    pub fn status(&self) -> GroupStatus {
        self.shared.state.lock().status.clone()
    }

    pub fn max_running(&self) -> usize {
        self.shared.state.lock().status.max_running
    }

    pub fn running_tasks(&self) -> usize {
        self.shared.state.lock().current.len()
    }

    pub fn remaining_tasks(&self) -> usize {
        self.shared.state.lock().status.remaining
    }

    pub fn completed_tasks(&self) -> usize {
        self.shared.state.lock().status.completed
    }

    pub fn progress(&self) -> u8 {
        self.shared.state.lock().progress
    }

    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().executing
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 执行中的任务在前，排队任务按队列顺序在后
    pub fn tasks(&self) -> Vec<Arc<T>> {
        let st = self.shared.state.lock();
        st.current.iter().chain(st.queue.iter()).cloned().collect()
    }

    pub fn queued_tasks(&self) -> Vec<Arc<T>> {
        self.shared.state.lock().queue.clone()
    }

    pub fn running(&self) -> Vec<Arc<T>> {
        self.shared.state.lock().current.clone()
    }

    /// 不持有任务组的句柄，供后台定时器使用
    pub fn downgrade(&self) -> WeakTaskGroup<T> {
        WeakTaskGroup {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// `TaskGroup` 的弱引用
pub struct WeakTaskGroup<T: Task> {
    shared: Weak<GroupShared<T>>,
}

impl<T: Task> Clone for WeakTaskGroup<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Task> WeakTaskGroup<T> {
    pub fn upgrade(&self) -> Option<TaskGroup<T>> {
        self.shared.upgrade().map(|shared| TaskGroup { shared })
    }
}

fn emit<T>(st: &GroupState<T>, event: GroupEvent<T>) {
    if let Some(tx) = &st.events {
        let _ = tx.send(event);
    }
}

fn spawn_notice_pump<T: Task>(
    weak: Weak<GroupShared<T>>,
    mut rx: mpsc::UnboundedReceiver<TaskNotice>,
) {
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            shared.handle_notice(notice);
        }
        debug!("任务组通知泵退出");
    });
}

impl<T: Task> GroupShared<T> {
    fn add_locked(&self, tasks: &[Arc<T>]) -> Result<(), TaskError> {
        let mut st = self.state.lock();
        for task in tasks {
            let core = task.core();
            if st.cancel_requested {
                return Err(TaskError::GroupStopping);
            }
            if st.members.contains_key(&core.id()) {
                return Err(TaskError::AlreadyGrouped(core.id()));
            }
            if core.is_finished() {
                return Err(TaskError::AlreadyFinished(core.id()));
            }
            core.attach(self.id, self.notice_tx.clone())?;

            st.members.insert(core.id(), task.clone());
            st.queue.push(task.clone());
            st.status.remaining += 1;
            let index = st.queue.len() - 1;
            debug!("任务加入任务组: group={}, task={}", self.name, core.name());
            emit(
                &st,
                GroupEvent::TaskAdded {
                    index,
                    task: task.clone(),
                },
            );
        }
        emit(&st, GroupEvent::StatusChanged(st.status.clone()));
        self.update_progress(&mut st);
        Ok(())
    }

    /// 按 FIFO 提升可执行任务，执行调用在锁外进行
    fn dispatch(&self) {
        let picked = {
            let mut st = self.state.lock();
            if !st.executing || st.cancel_requested {
                return;
            }

            let mut picked = Vec::new();
            while st.current.len() < st.status.max_running {
                let Some(pos) = st
                    .queue
                    .iter()
                    .position(|t| t.core().state() == TaskState::Idle)
                else {
                    break;
                };
                let task = st.queue.remove(pos);
                st.current.push(task.clone());
                picked.push(task);
            }
            if picked.is_empty() {
                return;
            }

            st.status.running = st.current.len();
            for task in &picked {
                if let Some(hooks) = &self.hooks {
                    hooks.on_task_started(task, &mut st.status);
                }
                emit(&st, GroupEvent::TaskStarted(task.clone()));
            }
            emit(&st, GroupEvent::StatusChanged(st.status.clone()));
            picked
        };

        for task in picked {
            let name = task.core().name();
            match task.execute() {
                Ok(true) => debug!("任务开始执行: group={}, task={}", self.name, name),
                // 取消请求已同步结束该任务，结束通知会把它移出执行列表
                Ok(false) => debug!("任务未执行（存在取消请求）: {}", name),
                Err(e) => warn!("任务启动失败: task={}, 错误: {}", name, e),
            }
        }
    }

    fn cancel_all(&self, abort: bool) -> bool {
        let tasks: Vec<Arc<T>> = {
            let mut st = self.state.lock();
            if !st.executing || st.cancel_requested {
                return false;
            }
            st.cancel_requested = true;
            st.current.iter().chain(st.queue.iter()).cloned().collect()
        };

        info!(
            "任务组{}: name={}, 任务数={}",
            if abort { "中止" } else { "停止" },
            self.name,
            tasks.len()
        );
        for task in tasks {
            if abort {
                task.cancel();
            } else {
                task.stop();
            }
        }
        true
    }

    fn handle_notice(&self, notice: TaskNotice) {
        let mut need_dispatch = false;
        {
            let mut st = self.state.lock();
            let Some(task) = st.members.get(&notice.task_id).cloned() else {
                return;
            };
            match notice.kind {
                NoticeKind::StateChanged { old, new } => {
                    emit(
                        &st,
                        GroupEvent::TaskStateChanged {
                            task: task.clone(),
                            old,
                            new,
                        },
                    );
                    // 暂停恢复后重新参与调度
                    if old == TaskState::Paused && new == TaskState::Idle {
                        need_dispatch = true;
                    }
                }
                NoticeKind::Progress(progress) => {
                    emit(&st, GroupEvent::TaskProgress { task, progress });
                    self.update_progress(&mut st);
                }
                NoticeKind::Updated => emit(&st, GroupEvent::TaskUpdated(task)),
                NoticeKind::Completed(outcome) => {
                    need_dispatch = self.on_task_completed(&mut st, task, outcome);
                }
            }
        }
        if need_dispatch {
            self.dispatch();
        }
    }

    /// 返回是否需要继续调度
    fn on_task_completed(&self, st: &mut GroupState<T>, task: Arc<T>, outcome: TaskOutcome) -> bool {
        let id = task.core().id();
        let was_running = st.current.iter().any(|t| t.core().id() == id);
        st.current.retain(|t| t.core().id() != id);

        if outcome.is_paused() {
            // 执行中被暂停的任务排到队首
            if was_running {
                st.queue.insert(0, task.clone());
            }
        } else {
            st.queue.retain(|t| t.core().id() != id);
            st.members.remove(&id);
            st.status.remaining = st.status.remaining.saturating_sub(1);
            if !outcome.is_cancelled() {
                st.status.completed += 1;
            }
            task.core().detach(self.id);
        }
        st.status.running = st.current.len();

        if let Some(hooks) = &self.hooks {
            hooks.on_task_completed(&task, &outcome, &mut st.status);
        }
        debug!(
            "任务组收到任务结束: group={}, task={}, state={}, running={}, remaining={}",
            self.name,
            task.core().name(),
            outcome.state(),
            st.status.running,
            st.status.remaining
        );
        emit(st, GroupEvent::TaskCompleted { task, outcome });
        self.update_progress(st);

        if st.status.remaining == 0 && st.executing {
            st.executing = false;
            st.cancel_requested = false;
            if let Some(hooks) = &self.hooks {
                hooks.on_stopped(&mut st.status);
            }
            emit(st, GroupEvent::StatusChanged(st.status.clone()));
            info!(
                "✅ 任务组执行结束: name={}, completed={}",
                self.name, st.status.completed
            );
            emit(st, GroupEvent::Stopped);
            self.executing_tx.send_replace(false);
            return false;
        }

        emit(st, GroupEvent::StatusChanged(st.status.clone()));
        true
    }

    /// 整体进度：已结束任务按 100 计，其余按各自进度
    fn update_progress(&self, st: &mut GroupState<T>) {
        let total = st.status.completed + st.status.remaining;
        let progress = if total == 0 {
            0
        } else {
            let sum: usize = st.status.completed * 100
                + st
                    .members
                    .values()
                    .map(|t| t.core().progress() as usize)
                    .sum::<usize>();
            (sum / total).min(100) as u8
        };
        if progress != st.progress {
            st.progress = progress;
            emit(st, GroupEvent::Progress(progress));
        }
    }
}
