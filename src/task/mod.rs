// 异步任务引擎：任务状态机 + 有界并发任务组

pub mod machine;
pub mod error;
pub mod events;
pub mod group;
pub mod state;

pub use machine::{Task, TaskCore};
pub use error::TaskError;
pub use events::{GroupEvent, GroupStatus};
pub use group::{GroupHooks, TaskGroup, WeakTaskGroup};
pub use state::{CancellationType, RunOutcome, TaskOutcome, TaskState};
