use std::time::Duration;

use ember_protocol::{CommandSender, GenerateRequest, GenerationUpdate, WorkerCommand, WorkerEvent};
use snafu::{ResultExt, ensure};
use tokio::time::Instant;

use crate::error::{
    AlreadyRunningSnafu, LoadAlreadyRequestedSnafu, NotReadySnafu, NotRunningSnafu, SessionError,
    SessionResult, TranscriptSnafu,
};
use crate::progress::ProgressAggregator;
use crate::snapshot::SnapshotPublisher;
use crate::state::{Metrics, RunState, SessionSnapshot, SessionStatus};
use crate::transcript::Transcript;

pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How long to wait for `complete` after an interrupt before forcing idle.
    pub interrupt_timeout: Duration,
    pub reason_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
            reason_enabled: false,
        }
    }
}

/// Owns all session state and interprets the worker event stream.
///
/// Every method returns immediately; nothing here awaits. Ordering of worker
/// events is trusted, so an event whose precondition fails is logged and
/// dropped rather than buffered.
pub struct SessionController {
    commands: CommandSender,
    publisher: SnapshotPublisher,
    interrupt_timeout: Duration,
    status: SessionStatus,
    run_state: RunState,
    loading_message: String,
    error: Option<String>,
    progress: ProgressAggregator,
    transcript: Transcript,
    metrics: Metrics,
    reason_enabled: bool,
    // Set by a reset during generation: the worker's remaining events belong
    // to a conversation that no longer exists locally.
    discarding: bool,
    // The worker reports `start` before anything else of a generation, so a
    // `complete` seen before it belongs to an earlier, abandoned one.
    started: bool,
    interrupt_deadline: Option<Instant>,
}

impl SessionController {
    /// Creates the controller and sends the one-time feature check.
    pub fn new(
        commands: CommandSender,
        publisher: SnapshotPublisher,
        config: ControllerConfig,
    ) -> Self {
        let controller = Self {
            commands,
            publisher,
            interrupt_timeout: config.interrupt_timeout,
            status: SessionStatus::Unset,
            run_state: RunState::Idle,
            loading_message: String::new(),
            error: None,
            progress: ProgressAggregator::new(),
            transcript: Transcript::new(),
            metrics: Metrics::default(),
            reason_enabled: config.reason_enabled,
            discarding: false,
            started: false,
            interrupt_deadline: None,
        };

        if let Err(error) = controller.send(WorkerCommand::Check, "new-check") {
            tracing::error!(error = %error, "feature check was not delivered");
        }
        controller.publish();
        controller
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn loading_message(&self) -> &str {
        &self.loading_message
    }

    pub fn reason_enabled(&self) -> bool {
        self.reason_enabled
    }

    /// Deadline armed by an interrupt; the runtime calls [`Self::expire_interrupt`] when it passes.
    pub fn interrupt_deadline(&self) -> Option<Instant> {
        self.interrupt_deadline
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            revision: 0,
            status: self.status,
            run_state: self.run_state,
            loading_message: self.loading_message.clone(),
            error: self.error.clone(),
            progress_items: self.progress.items().to_vec(),
            turns: self.transcript.turns().to_vec(),
            metrics: self.metrics,
            reason_enabled: self.reason_enabled,
        }
    }

    /// Requests model load. Status moves to loading before the worker acknowledges.
    pub fn load(&mut self) -> SessionResult<()> {
        ensure!(
            self.status == SessionStatus::Unset,
            LoadAlreadyRequestedSnafu {
                stage: "load",
                status: self.status,
            }
        );

        self.send(WorkerCommand::Load, "load")?;
        self.status = SessionStatus::Loading;
        tracing::info!("model load requested");
        self.publish();
        Ok(())
    }

    /// Appends a user turn and dispatches generation for it.
    pub fn submit(&mut self, text: impl Into<String>) -> SessionResult<()> {
        ensure!(
            self.status == SessionStatus::Ready,
            NotReadySnafu {
                stage: "submit",
                status: self.status,
            }
        );
        ensure!(
            !self.run_state.is_running(),
            AlreadyRunningSnafu { stage: "submit" }
        );

        let previous_len = self.transcript.len();
        self.transcript
            .append_user(text)
            .context(TranscriptSnafu { stage: "submit" })?;

        if let Err(error) = self.dispatch_generate() {
            self.transcript.truncate(previous_len);
            return Err(error);
        }
        self.publish();
        Ok(())
    }

    /// Asks the worker to stop. Idle is reached only through the worker's `complete`
    /// or, failing that, the interrupt deadline.
    pub fn interrupt(&mut self) -> SessionResult<()> {
        ensure!(
            self.run_state.is_running(),
            NotRunningSnafu {
                stage: "interrupt"
            }
        );

        self.send(WorkerCommand::Interrupt, "interrupt")?;
        self.arm_interrupt_deadline();
        tracing::info!("interrupt requested");
        self.publish();
        Ok(())
    }

    /// Starts a fresh conversation locally and on the worker.
    pub fn reset(&mut self) -> SessionResult<()> {
        let interrupting = self.run_state.is_running() && !self.discarding;
        if interrupting {
            self.send(WorkerCommand::Interrupt, "reset-interrupt")?;
        }
        self.send(WorkerCommand::Reset, "reset")?;

        if interrupting {
            self.discarding = true;
            self.arm_interrupt_deadline();
        }
        self.transcript.reset();
        self.metrics.clear();
        tracing::info!(discarding = self.discarding, "conversation reset");
        self.publish();
        Ok(())
    }

    /// Reasoning mode applies to the next dispatched generation.
    pub fn set_reason_enabled(&mut self, enabled: bool) {
        if self.reason_enabled == enabled {
            return;
        }
        self.reason_enabled = enabled;
        self.publish();
    }

    /// Flips reasoning mode and returns the new value.
    pub fn toggle_reasoning(&mut self) -> bool {
        self.set_reason_enabled(!self.reason_enabled);
        self.reason_enabled
    }

    pub fn handle_event(&mut self, event: WorkerEvent) {
        let name = event.name();
        let applied = match event {
            WorkerEvent::Loading { data } => self.on_loading(data),
            WorkerEvent::Initiate(progress) => {
                let accepted = self.accepts_load_event(name);
                if accepted {
                    self.progress.on_initiate(progress);
                }
                accepted
            }
            WorkerEvent::Progress(progress) => {
                let accepted = self.accepts_load_event(name);
                if accepted {
                    self.progress.on_progress(progress);
                }
                accepted
            }
            WorkerEvent::Done { file } => {
                let accepted = self.accepts_load_event(name);
                if accepted {
                    self.progress.on_done(&file);
                }
                accepted
            }
            WorkerEvent::Ready => self.on_ready(),
            WorkerEvent::Start => self.on_start(),
            WorkerEvent::Update(update) => self.on_update(update),
            WorkerEvent::Complete => self.on_complete(),
            WorkerEvent::Error { data } => {
                tracing::error!(error = %data, "inference worker reported an error");
                self.error = Some(data);
                true
            }
        };

        if applied {
            self.publish();
        }
    }

    /// Forces idle when the worker never confirmed an interrupt. Returns whether it fired.
    pub fn expire_interrupt(&mut self) -> bool {
        if self.interrupt_deadline.take().is_none() || !self.run_state.is_running() {
            return false;
        }

        tracing::warn!(
            timeout_ms = self.interrupt_timeout.as_millis() as u64,
            "worker did not confirm interrupt in time; forcing idle"
        );
        self.finish_generation();
        self.publish();
        true
    }

    fn on_loading(&mut self, message: String) -> bool {
        if self.status == SessionStatus::Ready {
            tracing::warn!("ignoring loading event after the model became ready");
            return false;
        }

        self.status = SessionStatus::Loading;
        self.loading_message = message;
        true
    }

    fn on_ready(&mut self) -> bool {
        if self.status != SessionStatus::Loading {
            tracing::warn!(status = %self.status, "ignoring ready event outside of loading");
            return false;
        }

        self.status = SessionStatus::Ready;
        tracing::info!("model ready");
        true
    }

    fn on_start(&mut self) -> bool {
        if self.run_state.is_running() {
            self.started = true;
        }
        if !self.accepts_generation_event("start") {
            return false;
        }

        match self.transcript.begin_assistant_turn() {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(error = %error, "start event violated transcript precondition");
                false
            }
        }
    }

    fn on_update(&mut self, update: GenerationUpdate) -> bool {
        if !self.accepts_generation_event("update") {
            return false;
        }

        self.metrics.record(update.tps, update.num_tokens);
        if let Err(error) = self
            .transcript
            .append_to_last_turn(&update.output, update.state)
        {
            tracing::error!(error = %error, "update event violated transcript precondition");
        }
        true
    }

    fn on_complete(&mut self) -> bool {
        if !self.run_state.is_running() {
            tracing::debug!("ignoring complete event while idle");
            return false;
        }
        if !self.started {
            tracing::warn!("ignoring complete event from an abandoned generation");
            return false;
        }

        tracing::info!(
            discarded = self.discarding,
            token_count = ?self.metrics.token_count,
            tokens_per_second = ?self.metrics.tokens_per_second,
            "generation complete"
        );
        self.finish_generation();
        true
    }

    fn accepts_load_event(&self, name: &'static str) -> bool {
        if self.status == SessionStatus::Loading {
            return true;
        }

        tracing::warn!(event = name, status = %self.status, "ignoring load event outside of loading");
        false
    }

    fn accepts_generation_event(&self, name: &'static str) -> bool {
        if self.status != SessionStatus::Ready || !self.run_state.is_running() {
            tracing::warn!(
                event = name,
                status = %self.status,
                run_state = ?self.run_state,
                "ignoring generation event without an active generation"
            );
            return false;
        }

        if self.discarding {
            tracing::debug!(event = name, "discarding event from reset conversation");
            return false;
        }

        true
    }

    /// Issues `generate` only while the transcript awaits a reply, which rules out
    /// re-triggering on the assistant turn appended by `start`.
    fn dispatch_generate(&mut self) -> SessionResult<()> {
        if !self.transcript.awaits_reply() {
            tracing::warn!(
                turns = self.transcript.len(),
                "skipping generate: transcript does not end with a user turn"
            );
            return Ok(());
        }

        let request = GenerateRequest {
            messages: self.transcript.turns().to_vec(),
            reason_enabled: self.reason_enabled,
        };
        self.send(WorkerCommand::Generate(request), "dispatch-generate")?;

        self.metrics.clear();
        self.run_state = RunState::Generating;
        self.started = false;
        self.interrupt_deadline = None;
        tracing::debug!(
            turns = self.transcript.len(),
            reason_enabled = self.reason_enabled,
            "generate dispatched"
        );
        Ok(())
    }

    fn finish_generation(&mut self) {
        self.transcript.close_open_turn();
        self.run_state = RunState::Idle;
        self.discarding = false;
        self.started = false;
        self.interrupt_deadline = None;
    }

    fn arm_interrupt_deadline(&mut self) {
        if self.interrupt_deadline.is_none() {
            self.interrupt_deadline = Some(Instant::now() + self.interrupt_timeout);
        }
    }

    fn send(&self, command: WorkerCommand, stage: &'static str) -> SessionResult<()> {
        let name = command.name();
        self.commands.send(command).map_err(|_| {
            tracing::error!(command = name, "failed to deliver command to inference worker");
            SessionError::WorkerUnavailable {
                stage,
                command: name,
            }
        })
    }

    fn publish(&self) {
        self.publisher.publish(self.snapshot());
    }
}
