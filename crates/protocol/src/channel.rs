use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{WorkerCommand, WorkerEvent};

pub type CommandSender = mpsc::UnboundedSender<WorkerCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<WorkerCommand>;
pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

/// Worker side of the channel pair.
///
/// The worker loop should exit once `commands` yields `None`, which happens
/// when the controller drops its [`WorkerHandle`] parts.
pub struct WorkerEndpoint {
    pub commands: CommandReceiver,
    pub events: EventSender,
}

/// Controller side of the channel pair plus the worker task lifetime.
pub struct WorkerHandle {
    commands: CommandSender,
    events: EventReceiver,
    guard: WorkerGuard,
}

impl WorkerHandle {
    /// Binds the spawned worker task so teardown is tied to the handle.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.guard.task = Some(task);
        self
    }

    /// Splits the handle; the returned guard aborts the worker task on drop.
    pub fn into_parts(self) -> (CommandSender, EventReceiver, WorkerGuard) {
        (self.commands, self.events, self.guard)
    }
}

/// Owns the worker task and aborts it when dropped, whatever the exit path.
#[derive(Default)]
pub struct WorkerGuard {
    task: Option<JoinHandle<()>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                tracing::debug!("aborting inference worker task");
            }
            task.abort();
        }
    }
}

/// Creates the single-consumer command/event channel pair for one worker.
pub fn worker_channel() -> (WorkerHandle, WorkerEndpoint) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        WorkerHandle {
            commands: command_tx,
            events: event_rx,
            guard: WorkerGuard::default(),
        },
        WorkerEndpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}
