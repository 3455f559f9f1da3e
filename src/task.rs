//! Steppable local tasks.
//!
//! A task advances one `service` call at a time. Failures in the work hook are contained in
//! the task's own state and never reach whoever is stepping it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Idle,
    Running,
    Done,
    DoneWithError,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::DoneWithError | TaskState::Cancelled
        )
    }
}

/// What one call of the work hook achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished,
}

/// State and timing shared by every task.
#[derive(Debug, Clone)]
pub struct TaskCore {
    pub id: String,
    pub model: String,
    state: TaskState,
    started_at: Option<Instant>,
    elapsed: Duration,
    error: Option<String>,
}

impl TaskCore {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            state: TaskState::Idle,
            started_at: None,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Time spent since the first `service` call, as of the latest one.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Row of a status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub model: String,
    pub state: TaskState,
    pub progress: Option<f64>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

pub trait Task: Send {
    fn core(&self) -> &TaskCore;

    fn core_mut(&mut self) -> &mut TaskCore;

    /// One unit of work.
    fn work(&mut self) -> anyhow::Result<Step>;

    fn progress(&self) -> Option<f64> {
        None
    }

    fn state(&self) -> TaskState {
        self.core().state
    }

    /// Advances the task by one step unless it has already finished.
    fn service(&mut self) {
        if self.core().state.is_finished() {
            return;
        }
        let now = Instant::now();
        let core = self.core_mut();
        if core.state == TaskState::Idle {
            core.state = TaskState::Running;
            core.started_at = Some(now);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.work()));
        let (next, error) = match outcome {
            Ok(Ok(Step::Continue)) => (TaskState::Running, None),
            Ok(Ok(Step::Finished)) => (TaskState::Done, None),
            Ok(Err(e)) => (TaskState::DoneWithError, Some(format!("{:#}", e))),
            Err(panic) => (TaskState::DoneWithError, Some(panic_message(&*panic))),
        };

        let core = self.core_mut();
        if let Some(error) = error {
            warn!(id = %core.id, model = %core.model, error = %error, "task failed");
            core.error = Some(error);
        }
        // A cancel issued from inside the hook wins.
        if core.state == TaskState::Running {
            core.state = next;
        }
        if let Some(started_at) = core.started_at {
            core.elapsed = started_at.elapsed();
        }
        if core.state.is_finished() {
            debug!(id = %core.id, state = ?core.state, elapsed = ?core.elapsed, "task finished");
        }
    }

    fn cancel(&mut self) {
        let core = self.core_mut();
        if !core.state.is_finished() {
            core.state = TaskState::Cancelled;
            if let Some(started_at) = core.started_at {
                core.elapsed = started_at.elapsed();
            }
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        let core = self.core();
        TaskSnapshot {
            id: core.id.clone(),
            model: core.model.clone(),
            state: core.state,
            progress: self.progress(),
            elapsed_ms: core.elapsed.as_millis() as u64,
            error: core.error.clone(),
        }
    }
}

/// Services `task` until it leaves `Running`, yielding to the runtime between steps.
///
/// Cancellation is only observed between steps.
pub async fn execute(task: &mut dyn Task) -> TaskState {
    loop {
        task.service();
        if task.state() != TaskState::Running {
            return task.state();
        }
        tokio::task::yield_now().await;
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
