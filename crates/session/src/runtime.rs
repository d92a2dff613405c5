use ember_protocol::{EventReceiver, WorkerGuard, WorkerHandle};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::controller::{ControllerConfig, SessionController};
use crate::error::{SessionError, SessionResult};
use crate::snapshot::{SnapshotReader, snapshot_channel};

/// User action forwarded from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIntent {
    Load,
    Submit(String),
    Interrupt,
    Reset,
    SetReasoning(bool),
    ToggleReasoning,
}

struct IntentEnvelope {
    intent: SessionIntent,
    reply: oneshot::Sender<SessionResult<()>>,
}

/// Cloneable handle the presentation layer uses to drive the session.
#[derive(Clone)]
pub struct SessionClient {
    intents: mpsc::UnboundedSender<IntentEnvelope>,
}

impl SessionClient {
    /// Queues an intent behind any pending worker events and waits for its outcome.
    pub async fn send(&self, intent: SessionIntent) -> SessionResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(IntentEnvelope {
                intent,
                reply: reply_tx,
            })
            .map_err(|_| SessionError::RuntimeClosed {
                stage: "send-intent",
            })?;

        reply_rx.await.map_err(|_| SessionError::RuntimeClosed {
            stage: "await-intent-reply",
        })?
    }

    pub async fn load(&self) -> SessionResult<()> {
        self.send(SessionIntent::Load).await
    }

    pub async fn submit(&self, text: impl Into<String>) -> SessionResult<()> {
        self.send(SessionIntent::Submit(text.into())).await
    }

    pub async fn interrupt(&self) -> SessionResult<()> {
        self.send(SessionIntent::Interrupt).await
    }

    pub async fn reset(&self) -> SessionResult<()> {
        self.send(SessionIntent::Reset).await
    }

    pub async fn set_reasoning(&self, enabled: bool) -> SessionResult<()> {
        self.send(SessionIntent::SetReasoning(enabled)).await
    }

    pub async fn toggle_reasoning(&self) -> SessionResult<()> {
        self.send(SessionIntent::ToggleReasoning).await
    }
}

/// Single-consumer event loop that serializes worker events, user intents and
/// the interrupt deadline onto one controller.
pub struct SessionRuntime {
    controller: SessionController,
    events: EventReceiver,
    intents: mpsc::UnboundedReceiver<IntentEnvelope>,
    // Dropped with the runtime, which aborts the worker task.
    _worker: WorkerGuard,
}

impl SessionRuntime {
    pub fn new(
        worker: WorkerHandle,
        config: ControllerConfig,
    ) -> (Self, SessionClient, SnapshotReader) {
        let (commands, events, guard) = worker.into_parts();
        let (publisher, snapshots) = snapshot_channel();
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();

        let runtime = Self {
            controller: SessionController::new(commands, publisher, config),
            events,
            intents: intent_rx,
            _worker: guard,
        };

        (
            runtime,
            SessionClient { intents: intent_tx },
            snapshots,
        )
    }

    /// Runs until every [`SessionClient`] is dropped.
    pub async fn run(mut self) {
        let mut worker_open = true;

        loop {
            let deadline = self.controller.interrupt_deadline();

            tokio::select! {
                event = self.events.recv(), if worker_open => match event {
                    Some(event) => {
                        tracing::trace!(event = event.name(), "worker event");
                        self.controller.handle_event(event);
                    }
                    None => {
                        worker_open = false;
                        tracing::error!("inference worker event stream closed");
                    }
                },
                envelope = self.intents.recv() => {
                    let Some(IntentEnvelope { intent, reply }) = envelope else {
                        break;
                    };

                    let result = apply_intent(&mut self.controller, intent);
                    if let Err(error) = &result {
                        tracing::warn!(error = %error, "session intent rejected");
                    }
                    let _ = reply.send(result);
                }
                () = wait_until(deadline), if deadline.is_some() => {
                    self.controller.expire_interrupt();
                }
            }
        }

        tracing::info!("session runtime stopped");
    }
}

fn apply_intent(controller: &mut SessionController, intent: SessionIntent) -> SessionResult<()> {
    match intent {
        SessionIntent::Load => controller.load(),
        SessionIntent::Submit(text) => controller.submit(text),
        SessionIntent::Interrupt => controller.interrupt(),
        SessionIntent::Reset => controller.reset(),
        SessionIntent::SetReasoning(enabled) => {
            controller.set_reason_enabled(enabled);
            Ok(())
        }
        SessionIntent::ToggleReasoning => {
            controller.toggle_reasoning();
            Ok(())
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
