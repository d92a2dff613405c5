use std::sync::Arc;
use std::time::Duration;

use ember_protocol::{
    GenerationPhase, GenerationUpdate, ProgressEvent, WorkerCommand, WorkerEndpoint, WorkerEvent,
    worker_channel,
};
use ember_session::{
    ControllerConfig, RunState, SessionError, SessionRuntime, SessionSnapshot, SessionStatus,
    SnapshotReader,
};

/// Replies to commands the way a well-behaved worker would.
async fn scripted_worker(mut endpoint: WorkerEndpoint, honor_interrupt: bool) {
    while let Some(command) = endpoint.commands.recv().await {
        let events = match command {
            WorkerCommand::Check | WorkerCommand::Reset => Vec::new(),
            WorkerCommand::Load => vec![
                WorkerEvent::loading("Loading model..."),
                WorkerEvent::Initiate(ProgressEvent::new("a")),
                WorkerEvent::Initiate(ProgressEvent::new("b")),
                WorkerEvent::Progress(ProgressEvent::new("a").with_progress(100.0)),
                WorkerEvent::done("a"),
                WorkerEvent::done("b"),
                WorkerEvent::Ready,
            ],
            WorkerCommand::Generate(request) if request.reason_enabled => vec![
                WorkerEvent::Start,
                update("weighing it", GenerationPhase::Thinking, 1),
                update("4", GenerationPhase::Answering, 2),
                WorkerEvent::Complete,
            ],
            // Without reasoning the stream is left open until interrupted.
            WorkerCommand::Generate(_) => vec![
                WorkerEvent::Start,
                update("once upon", GenerationPhase::Answering, 1),
            ],
            WorkerCommand::Interrupt if honor_interrupt => vec![WorkerEvent::Complete],
            WorkerCommand::Interrupt => Vec::new(),
        };

        for event in events {
            if endpoint.events.send(event).is_err() {
                return;
            }
        }
    }
}

fn update(output: &str, state: GenerationPhase, num_tokens: u64) -> WorkerEvent {
    WorkerEvent::Update(GenerationUpdate {
        output: output.to_string(),
        tps: Some(20.0),
        num_tokens: Some(num_tokens),
        state,
    })
}

async fn wait_for(
    snapshots: &mut SnapshotReader,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> Arc<SessionSnapshot> {
    let current = snapshots.load();
    if predicate(&current) {
        return current;
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let snapshot = snapshots.changed().await.expect("controller stopped");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("snapshot condition not reached")
}

fn start(honor_interrupt: bool) -> (ember_session::SessionClient, SnapshotReader) {
    let (handle, endpoint) = worker_channel();
    let task = tokio::spawn(scripted_worker(endpoint, honor_interrupt));
    let (runtime, client, snapshots) = SessionRuntime::new(
        handle.with_task(task),
        ControllerConfig {
            interrupt_timeout: Duration::from_secs(5),
            reason_enabled: false,
        },
    );
    tokio::spawn(runtime.run());
    (client, snapshots)
}

#[tokio::test]
async fn load_and_reasoned_generation_end_to_end() {
    let (client, mut snapshots) = start(true);

    assert!(matches!(
        client.submit("too early").await,
        Err(SessionError::NotReady { .. })
    ));

    client.load().await.unwrap();
    let ready = wait_for(&mut snapshots, |s| s.status == SessionStatus::Ready).await;
    assert!(ready.progress_items.is_empty());
    assert_eq!(ready.loading_message, "Loading model...");

    client.set_reasoning(true).await.unwrap();
    client.submit("2+2=?").await.unwrap();

    let done = wait_for(&mut snapshots, |s| {
        s.run_state == RunState::Idle && s.turns.len() == 2
    })
    .await;
    let answer = &done.turns[1];
    assert_eq!(answer.content, "weighing it4");
    assert_eq!(answer.answer_index, Some("weighing it".len()));
    assert_eq!(answer.answer(), "4");
    assert_eq!(done.metrics.token_count, Some(2));
    assert_eq!(done.metrics.elapsed_secs(), Some(0.1));
}

#[tokio::test]
async fn interrupt_is_acknowledged_by_worker_complete() {
    let (client, mut snapshots) = start(true);
    client.load().await.unwrap();
    wait_for(&mut snapshots, |s| s.status == SessionStatus::Ready).await;

    client.submit("tell me a story").await.unwrap();
    wait_for(&mut snapshots, |s| {
        s.turns.last().is_some_and(|turn| turn.content == "once upon")
    })
    .await;

    client.interrupt().await.unwrap();
    let idle = wait_for(&mut snapshots, |s| !s.is_running()).await;
    assert_eq!(idle.turns.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_interrupt_times_out_to_idle() {
    let (client, mut snapshots) = start(false);
    client.load().await.unwrap();
    wait_for(&mut snapshots, |s| s.status == SessionStatus::Ready).await;

    client.submit("tell me a story").await.unwrap();
    wait_for(&mut snapshots, |s| s.turns.len() == 2).await;

    let interrupted_at = tokio::time::Instant::now();
    client.interrupt().await.unwrap();
    let idle = wait_for(&mut snapshots, |s| !s.is_running()).await;

    assert!(interrupted_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(idle.turns[1].content, "once upon");

    // The session accepts new work once forced idle.
    client.reset().await.unwrap();
    let cleared = wait_for(&mut snapshots, |s| s.turns.is_empty()).await;
    assert_eq!(cleared.metrics.token_count, None);
}

#[tokio::test]
async fn client_fails_once_runtime_is_gone() {
    let (handle, _endpoint) = worker_channel();
    let (runtime, client, _snapshots) = SessionRuntime::new(handle, ControllerConfig::default());
    drop(runtime);

    assert!(matches!(
        client.load().await,
        Err(SessionError::RuntimeClosed { .. })
    ));
}
