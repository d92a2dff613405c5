use std::sync::Arc;

use ember_protocol::{
    EventSender, GenerateRequest, GenerationUpdate, ProgressEvent, WorkerCommand, WorkerEndpoint,
    WorkerEvent, WorkerHandle, worker_channel,
};
use futures::StreamExt;
use snafu::ResultExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::{CATALOG_RESOURCE, fetch_catalog};
use crate::config::{CompletionsSnafu, WorkerConfig, WorkerError, WorkerResult};
use crate::stream::{TokenMeter, map_stream_item, open_stream};

/// Why an active generation was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The session asked to stop; the generation still reports `complete`.
    Interrupt,
    /// A newer generation replaced this one; it ends silently.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    Cancelled(CancelReason),
    /// The session stopped listening or the worker is shutting down.
    Detached,
}

struct ActiveGeneration {
    cancel: oneshot::Sender<CancelReason>,
    task: JoinHandle<()>,
}

/// Spawns the inference worker on the current tokio runtime.
pub fn spawn_worker(config: WorkerConfig) -> WorkerHandle {
    let (handle, endpoint) = worker_channel();
    let task = tokio::spawn(run_worker(config, endpoint));
    handle.with_task(task)
}

/// Command loop. Exits once the session drops its command sender.
pub async fn run_worker(config: WorkerConfig, endpoint: WorkerEndpoint) {
    let WorkerEndpoint {
        mut commands,
        events,
    } = endpoint;
    let mut worker = Worker::new(config, events);

    while let Some(command) = commands.recv().await {
        tracing::debug!(command = command.name(), "worker command received");
        match command {
            WorkerCommand::Check => worker.check(),
            WorkerCommand::Load => worker.load().await,
            WorkerCommand::Generate(request) => worker.generate(request),
            WorkerCommand::Interrupt | WorkerCommand::Reset => {
                worker.cancel_active(CancelReason::Interrupt)
            }
        }
    }

    tracing::info!("inference worker stopped");
}

struct Worker {
    config: Arc<WorkerConfig>,
    events: EventSender,
    active: Option<ActiveGeneration>,
    // Interrupted generations that have not reported `complete` yet.
    interrupted: Vec<JoinHandle<()>>,
}

impl Worker {
    fn new(config: WorkerConfig, events: EventSender) -> Self {
        Self {
            config: Arc::new(config),
            events,
            active: None,
            interrupted: Vec::new(),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session is no longer listening for worker events");
        }
    }

    fn emit_error(&self, error: &WorkerError) {
        self.emit(WorkerEvent::error(error.to_string()));
    }

    fn check(&self) {
        if !self.config.has_api_key() {
            tracing::warn!(model_id = %self.config.model_id, "no API key configured");
            self.emit(WorkerEvent::error(
                "No API key configured. Set EMBER_PROVIDER__API_KEY or OPENAI_API_KEY.",
            ));
        }
    }

    async fn load(&self) {
        let model_id = self.config.model_id.as_str();
        self.emit(WorkerEvent::loading(format!("Loading model {model_id}...")));
        self.emit(WorkerEvent::Initiate(
            ProgressEvent::new(CATALOG_RESOURCE).with_name(model_id),
        ));

        match fetch_catalog(&self.config).await {
            Ok(catalog) => {
                self.emit(WorkerEvent::Progress(
                    ProgressEvent::new(CATALOG_RESOURCE)
                        .with_progress(100.0)
                        .with_bytes(catalog.payload_bytes, catalog.payload_bytes),
                ));
                self.emit(WorkerEvent::done(CATALOG_RESOURCE));

                if catalog.contains(model_id) {
                    tracing::info!(
                        model_id,
                        model_count = catalog.model_ids.len(),
                        "model catalog loaded"
                    );
                } else {
                    tracing::warn!(
                        model_id,
                        model_count = catalog.model_ids.len(),
                        "configured model is not listed by the provider"
                    );
                }
                self.emit(WorkerEvent::Ready);
            }
            Err(error) => {
                tracing::error!(model_id, error = %error, "model catalog fetch failed");
                self.emit(WorkerEvent::done(CATALOG_RESOURCE));
                self.emit_error(&error);
            }
        }
    }

    fn generate(&mut self, request: GenerateRequest) {
        self.cancel_active(CancelReason::Superseded);
        self.abort_interrupted();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_generation(
            Arc::clone(&self.config),
            request,
            self.events.clone(),
            cancel_rx,
        ));
        self.active = Some(ActiveGeneration {
            cancel: cancel_tx,
            task,
        });
    }

    fn cancel_active(&mut self, reason: CancelReason) {
        let Some(active) = self.active.take() else {
            return;
        };
        if active.task.is_finished() {
            return;
        }

        tracing::debug!(reason = ?reason, "cancelling active generation");
        // The task may finish between the check and the send.
        let _ = active.cancel.send(reason);
        if reason == CancelReason::Interrupt {
            self.interrupted.retain(|task| !task.is_finished());
            self.interrupted.push(active.task);
        }
    }

    /// A new generation owns the event stream; an interrupted one that is still
    /// winding down must not deliver its `complete` into it.
    fn abort_interrupted(&mut self) {
        for task in self.interrupted.drain(..) {
            if !task.is_finished() {
                tracing::warn!("aborting interrupted generation that never completed");
                task.abort();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
        for task in self.interrupted.drain(..) {
            task.abort();
        }
    }
}

async fn run_generation(
    config: Arc<WorkerConfig>,
    request: GenerateRequest,
    events: EventSender,
    mut cancel_rx: oneshot::Receiver<CancelReason>,
) {
    if events.send(WorkerEvent::Start).is_err() {
        return;
    }

    let end = match stream_generation(&config, &request, &events, &mut cancel_rx).await {
        Ok(end) => end,
        Err(error) => {
            tracing::error!(
                model_id = %config.model_id,
                error = %error,
                "generation failed"
            );
            let _ = events.send(WorkerEvent::error(error.to_string()));
            StreamEnd::Finished
        }
    };

    match end {
        StreamEnd::Finished | StreamEnd::Cancelled(CancelReason::Interrupt) => {
            let _ = events.send(WorkerEvent::Complete);
        }
        StreamEnd::Cancelled(CancelReason::Superseded) | StreamEnd::Detached => {}
    }
}

async fn stream_generation(
    config: &WorkerConfig,
    request: &GenerateRequest,
    events: &EventSender,
    cancel_rx: &mut oneshot::Receiver<CancelReason>,
) -> WorkerResult<StreamEnd> {
    let mut stream = tokio::select! {
        reason = &mut *cancel_rx => return Ok(cancelled(reason)),
        opened = open_stream(config, request) => opened?,
    };

    let mut meter = TokenMeter::new();
    loop {
        tokio::select! {
            reason = &mut *cancel_rx => {
                // Stops provider IO promptly.
                stream.cancel();
                let end = cancelled(reason);
                tracing::debug!(end = ?end, tokens = meter.count(), "provider stream cancelled");
                return Ok(end);
            }
            next_item = stream.next() => match next_item {
                Some(Ok(item)) => {
                    let Some(delta) = map_stream_item(item, request.reason_enabled) else {
                        continue;
                    };
                    let (tps, num_tokens) = meter.record(Instant::now());
                    let update = WorkerEvent::Update(GenerationUpdate {
                        output: delta.text,
                        tps,
                        num_tokens: Some(num_tokens),
                        state: delta.phase,
                    });
                    if events.send(update).is_err() {
                        stream.cancel();
                        return Ok(StreamEnd::Detached);
                    }
                }
                Some(Err(source)) => {
                    tracing::warn!(error = %source, "provider stream emitted an error chunk");
                    return Err(source).context(CompletionsSnafu {
                        stage: "stream-chunk",
                    });
                }
                None => {
                    tracing::debug!(tokens = meter.count(), "provider stream finished");
                    return Ok(StreamEnd::Finished);
                }
            },
        }
    }
}

fn cancelled(reason: Result<CancelReason, oneshot::error::RecvError>) -> StreamEnd {
    match reason {
        Ok(reason) => StreamEnd::Cancelled(reason),
        Err(_) => StreamEnd::Detached,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_protocol::{EventReceiver, Turn};

    use super::*;

    async fn next_event(events: &mut EventReceiver) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("worker event timed out")
            .expect("worker stopped")
    }

    #[tokio::test]
    async fn check_without_api_key_reports_error() {
        let (commands, mut events, _guard) = spawn_worker(WorkerConfig::default()).into_parts();
        commands.send(WorkerCommand::Check).unwrap();

        assert_eq!(next_event(&mut events).await.name(), "error");
    }

    #[tokio::test]
    async fn load_failure_finishes_catalog_progress_before_error() {
        let (commands, mut events, _guard) = spawn_worker(WorkerConfig::default()).into_parts();
        commands.send(WorkerCommand::Load).unwrap();

        let WorkerEvent::Loading { data } = next_event(&mut events).await else {
            panic!("expected loading event");
        };
        assert!(data.contains(crate::config::DEFAULT_MODEL_ID));

        let WorkerEvent::Initiate(progress) = next_event(&mut events).await else {
            panic!("expected initiate event");
        };
        assert_eq!(progress.file, CATALOG_RESOURCE);

        assert_eq!(next_event(&mut events).await, WorkerEvent::done(CATALOG_RESOURCE));
        assert_eq!(next_event(&mut events).await.name(), "error");
    }

    #[tokio::test]
    async fn failed_generation_still_completes() {
        let (commands, mut events, _guard) = spawn_worker(WorkerConfig::default()).into_parts();
        commands
            .send(WorkerCommand::Generate(GenerateRequest {
                messages: vec![Turn::user("hello")],
                reason_enabled: false,
            }))
            .unwrap();

        assert_eq!(next_event(&mut events).await, WorkerEvent::Start);
        assert_eq!(next_event(&mut events).await.name(), "error");
        assert_eq!(next_event(&mut events).await, WorkerEvent::Complete);
    }

    #[tokio::test]
    async fn new_generation_aborts_unfinished_interrupted_one() {
        let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
        let mut worker = Worker::new(WorkerConfig::default(), events_tx.clone());

        // A generation that ignores its interrupt for a long time before completing.
        let (cancel, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = cancel_rx.await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = events_tx.send(WorkerEvent::Complete);
        });
        let stalled = task.abort_handle();
        worker.active = Some(ActiveGeneration { cancel, task });

        worker.cancel_active(CancelReason::Interrupt);
        assert!(worker.active.is_none());
        assert!(!stalled.is_finished());

        worker.generate(GenerateRequest {
            messages: vec![Turn::user("next")],
            reason_enabled: false,
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !stalled.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("interrupted generation was not aborted");

        // Only the new generation reports.
        assert_eq!(next_event(&mut events).await, WorkerEvent::Start);
        assert_eq!(next_event(&mut events).await.name(), "error");
        assert_eq!(next_event(&mut events).await, WorkerEvent::Complete);
        drop(worker);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn interrupt_without_generation_is_silent() {
        let (commands, mut events, _guard) = spawn_worker(WorkerConfig::default()).into_parts();
        commands.send(WorkerCommand::Interrupt).unwrap();
        commands.send(WorkerCommand::Reset).unwrap();
        drop(commands);

        // The loop ends once commands close; no event was produced.
        assert!(events.recv().await.is_none());
    }
}
