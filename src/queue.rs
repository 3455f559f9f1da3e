//! Single-worker dispatcher for local tasks.
//!
//! Producers on any thread push `Command`s into a FIFO; one worker thread owns every task and
//! is the only thing that steps them. Status tables go out through a channel of capacity one,
//! and a table nobody is waiting for is dropped rather than blocking the worker.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::task::{panic_message, Task, TaskSnapshot};

/// Snapshots by task id.
pub type StatusTable = BTreeMap<String, TaskSnapshot>;

/// Builds a task from its id and the `task` payload of an `ADD_TASK` command.
pub type TaskBuilder = Box<dyn Fn(&str, &Value) -> anyhow::Result<Box<dyn Task>> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddTask { model: String, task: Value },
    GetStatus,
    CancelTask { id: String },
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    AddTask,
    GetStatus,
    CancelTask,
    Quit,
}

/// Wire form of a `Command`: `{"msgtype": ..., "model": ..., "task": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msgtype: MsgType,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub task: Value,
}

impl TryFrom<Envelope> for Command {
    type Error = RemoteError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        Ok(match envelope.msgtype {
            MsgType::AddTask => {
                if envelope.model.is_empty() {
                    return Err(RemoteError::InvalidArgument(
                        "ADD_TASK needs a model".to_string(),
                    ));
                }
                Command::AddTask {
                    model: envelope.model,
                    task: envelope.task,
                }
            }
            MsgType::GetStatus => Command::GetStatus,
            MsgType::CancelTask => {
                let id = task_id(&envelope.task).ok_or_else(|| {
                    RemoteError::InvalidArgument("CANCEL_TASK needs task.id".to_string())
                })?;
                Command::CancelTask { id }
            }
            MsgType::Quit => Command::Quit,
        })
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        let (msgtype, model, task) = match command {
            Command::AddTask { model, task } => (MsgType::AddTask, model, task),
            Command::GetStatus => (MsgType::GetStatus, String::new(), Value::Null),
            Command::CancelTask { id } => (
                MsgType::CancelTask,
                String::new(),
                serde_json::json!({ "id": id }),
            ),
            Command::Quit => (MsgType::Quit, String::new(), Value::Null),
        };
        Envelope {
            msgtype,
            model,
            task,
        }
    }
}

fn task_id(task: &Value) -> Option<String> {
    match task.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Task constructors by model name.
#[derive(Default)]
pub struct TaskBuilders {
    builders: HashMap<String, TaskBuilder>,
}

impl TaskBuilders {
    pub fn register<F>(&mut self, model: impl Into<String>, builder: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<Box<dyn Task>> + Send + 'static,
    {
        self.builders.insert(model.into(), Box::new(builder));
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }
}

pub struct TaskQueue {
    commands: flume::Sender<Command>,
    status: flume::Receiver<StatusTable>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Spawns the worker thread.
    pub fn start(builders: TaskBuilders) -> Result<Self, RemoteError> {
        let (commands, command_rx) = flume::unbounded();
        let (status_tx, status) = flume::bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("task-queue".to_string())
                .spawn(move || Worker::new(builders, status_tx).run(command_rx, running))?
        };
        Ok(Self {
            commands,
            status,
            running,
            worker: Some(worker),
        })
    }

    pub fn send(&self, command: Command) -> Result<(), RemoteError> {
        self.commands
            .send(command)
            .map_err(|_| RemoteError::QueueClosed)
    }

    /// Parses and enqueues a JSON command envelope.
    pub fn send_envelope(&self, json: &str) -> Result<(), RemoteError> {
        let envelope: Envelope = serde_json::from_str(json)?;
        self.send(envelope.try_into()?)
    }

    pub fn add_task(&self, model: impl Into<String>, task: Value) -> Result<(), RemoteError> {
        self.send(Command::AddTask {
            model: model.into(),
            task,
        })
    }

    pub fn request_status(&self) -> Result<(), RemoteError> {
        self.send(Command::GetStatus)
    }

    pub fn cancel_task(&self, id: impl Into<String>) -> Result<(), RemoteError> {
        self.send(Command::CancelTask { id: id.into() })
    }

    /// A published status table, if one is waiting.
    pub fn try_status(&self) -> Option<StatusTable> {
        self.status.try_recv().ok()
    }

    /// Waits up to `timeout` for a status table.
    pub fn recv_status(&self, timeout: Duration) -> Option<StatusTable> {
        self.status.recv_timeout(timeout).ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the worker and waits for it.
    ///
    /// `QUIT` is enqueued here, so this returns even when nothing else is being sent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Quit);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("task queue worker panicked");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    builders: TaskBuilders,
    tasks: BTreeMap<String, Box<dyn Task>>,
    status: flume::Sender<StatusTable>,
}

impl Worker {
    fn new(builders: TaskBuilders, status: flume::Sender<StatusTable>) -> Self {
        Self {
            builders,
            tasks: BTreeMap::new(),
            status,
        }
    }

    fn run(mut self, commands: flume::Receiver<Command>, running: Arc<AtomicBool>) {
        info!("task queue started");
        while running.load(Ordering::SeqCst) {
            let Ok(command) = commands.recv() else {
                break;
            };
            match command {
                Command::AddTask { model, task } => self.add_task(&model, &task),
                Command::GetStatus => self.publish_status(),
                Command::CancelTask { id } => self.cancel_task(&id),
                Command::Quit => break,
            }
        }
        running.store(false, Ordering::SeqCst);
        info!(tasks = self.tasks.len(), "task queue stopped");
    }

    fn add_task(&mut self, model: &str, task: &Value) {
        let Some(builder) = self.builders.builders.get(model) else {
            warn!(model, "no task builder registered, ignoring ADD_TASK");
            return;
        };
        let id = task_id(task).unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.tasks.contains_key(&id) {
            warn!(id = %id, "task id already queued, ignoring ADD_TASK");
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| builder(&id, task))) {
            Ok(Ok(built)) => {
                debug!(id = %id, model, "task added");
                self.tasks.insert(id, built);
            }
            Ok(Err(e)) => warn!(model, error = ?e, "failed to build task"),
            Err(panic) => {
                warn!(model, error = %panic_message(&*panic), "task builder panicked")
            }
        }
    }

    fn publish_status(&mut self) {
        let table: StatusTable = self
            .tasks
            .iter_mut()
            .map(|(id, task)| {
                task.service();
                (id.clone(), task.snapshot())
            })
            .collect();
        match self.status.try_send(table) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                debug!("previous status table not consumed, dropping this one")
            }
            Err(flume::TrySendError::Disconnected(_)) => debug!("no status consumer"),
        }
    }

    fn cancel_task(&mut self, id: &str) {
        match self.tasks.remove(id) {
            Some(mut task) => {
                task.cancel();
                debug!(id, "task cancelled");
            }
            None => warn!(id, "no such task to cancel"),
        }
    }
}
