//! HTTP 下载任务组
//!
//! 在通用任务组之上增加组级传输速率：定时采样执行中任务的累计字节数，
//! 速率取本次采样与上次结果的平均值，平滑抖动。

use super::task::HttpFileDownloadTask;
use crate::config::DownloadConfig;
use crate::task::{GroupHooks, GroupStatus, Task, TaskGroup, TaskOutcome, WeakTaskGroup};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

struct SamplerState {
    /// 任务组执行期间才采样
    active: bool,
    /// 每个执行中任务上次采样时的累计字节数
    baselines: HashMap<Uuid, u64>,
    /// 两次采样之间结束的任务留下的字节数
    residual: u64,
    previous: Option<u64>,
    last_sample: Instant,
}

/// 组级速率采样器
pub struct RateSampler {
    state: Mutex<SamplerState>,
}

impl Default for RateSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RateSampler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SamplerState {
                active: false,
                baselines: HashMap::new(),
                residual: 0,
                previous: None,
                last_sample: Instant::now(),
            }),
        }
    }

    /// 采样一次并写入状态快照，返回是否需要发出 StatusChanged
    pub fn sample(&self, running: &[Arc<HttpFileDownloadTask>], status: &mut GroupStatus) -> bool {
        self.sample_at(running, status, Instant::now())
    }

    fn sample_at(
        &self,
        running: &[Arc<HttpFileDownloadTask>],
        status: &mut GroupStatus,
        now: Instant,
    ) -> bool {
        let mut st = self.state.lock();
        if !st.active {
            return false;
        }
        let mut bytes = std::mem::take(&mut st.residual);
        for task in running {
            let current = task.transferred();
            let baseline = st.baselines.entry(task.core().id()).or_insert(current);
            bytes += current.saturating_sub(*baseline);
            *baseline = current;
        }

        let secs = now.saturating_duration_since(st.last_sample).as_secs_f64();
        st.last_sample = now;
        let rate = if secs > 0.0 {
            (bytes as f64 / secs) as u64
        } else {
            0
        };
        let smoothed = match st.previous {
            Some(prev) => (rate + prev) / 2,
            None => rate,
        };
        st.previous = Some(smoothed);

        let changed = status.transfer_rate != Some(smoothed);
        status.transfer_rate = Some(smoothed);
        changed
    }
}

impl GroupHooks<HttpFileDownloadTask> for RateSampler {
    fn on_started(&self, status: &mut GroupStatus) {
        let mut st = self.state.lock();
        st.active = true;
        st.baselines.clear();
        st.residual = 0;
        st.previous = None;
        st.last_sample = Instant::now();
        status.transfer_rate = Some(0);
    }

    fn on_stopped(&self, status: &mut GroupStatus) {
        self.state.lock().active = false;
        status.transfer_rate = Some(0);
    }

    fn on_task_started(&self, task: &Arc<HttpFileDownloadTask>, _status: &mut GroupStatus) {
        self.state
            .lock()
            .baselines
            .insert(task.core().id(), task.transferred());
    }

    fn on_task_completed(
        &self,
        task: &Arc<HttpFileDownloadTask>,
        _outcome: &TaskOutcome,
        _status: &mut GroupStatus,
    ) {
        let mut st = self.state.lock();
        if let Some(baseline) = st.baselines.remove(&task.core().id()) {
            st.residual += task.transferred().saturating_sub(baseline);
        }
    }
}

/// HTTP 下载任务组，解引用为通用任务组
#[derive(Clone)]
pub struct HttpDownloadGroup {
    group: TaskGroup<HttpFileDownloadTask>,
    sampler: Arc<RateSampler>,
}

impl HttpDownloadGroup {
    pub fn new(name: impl Into<String>, config: &DownloadConfig) -> Self {
        let sampler = Arc::new(RateSampler::new());
        let group = TaskGroup::with_hooks(
            name,
            config.max_concurrent_downloads,
            sampler.clone() as Arc<dyn GroupHooks<HttpFileDownloadTask>>,
        );
        spawn_rate_timer(group.downgrade(), sampler.clone(), config.rate_sample_interval());
        Self { group, sampler }
    }

    pub fn group(&self) -> &TaskGroup<HttpFileDownloadTask> {
        &self.group
    }

    /// 立即采样一次
    pub fn sample_now(&self) {
        let sampler = self.sampler.clone();
        self.group
            .refresh_status(move |running, status| sampler.sample(running, status));
    }

    pub fn transfer_rate(&self) -> u64 {
        self.group.status().transfer_rate.unwrap_or(0)
    }
}

impl Deref for HttpDownloadGroup {
    type Target = TaskGroup<HttpFileDownloadTask>;

    fn deref(&self) -> &Self::Target {
        &self.group
    }
}

fn spawn_rate_timer(
    weak: WeakTaskGroup<HttpFileDownloadTask>,
    sampler: Arc<RateSampler>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(group) = weak.upgrade() else {
                break;
            };
            if !group.is_busy() {
                continue;
            }
            let sampler = sampler.clone();
            group.refresh_status(move |running, status| sampler.sample(running, status));
        }
        debug!("速率采样定时器退出");
    });
}
