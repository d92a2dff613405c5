use serde::{Deserialize, Serialize};

use crate::message::Turn;

/// Payload of a `generate` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub messages: Vec<Turn>,
    pub reason_enabled: bool,
}

/// Controller to worker message.
///
/// Every command is fire-and-forget: the worker answers only through the
/// ordered [`WorkerEvent`] stream, never with a correlated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkerCommand {
    Check,
    Load,
    Generate(GenerateRequest),
    Interrupt,
    Reset,
}

impl WorkerCommand {
    /// Wire tag, used for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Load => "load",
            Self::Generate(_) => "generate",
            Self::Interrupt => "interrupt",
            Self::Reset => "reset",
        }
    }
}

/// Load progress record for one resource.
///
/// Only `file` is mandatory; any other field present on a `progress` event
/// overwrites the tracked value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_bytes(mut self, loaded: u64, total: u64) -> Self {
        self.loaded = Some(loaded);
        self.total = Some(total);
        self
    }
}

/// Worker-reported sub-phase of generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPhase {
    Thinking,
    Answering,
    #[default]
    #[serde(other)]
    Other,
}

/// One streamed chunk of generated text plus throughput counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationUpdate {
    pub output: String,
    #[serde(default)]
    pub tps: Option<f64>,
    #[serde(default)]
    pub num_tokens: Option<u64>,
    #[serde(default)]
    pub state: GenerationPhase,
}

/// Worker to controller lifecycle event.
///
/// Events of a single generation are totally ordered: `start`, then every
/// `update`, then `complete` (optionally preceded by `error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerEvent {
    Loading { data: String },
    Initiate(ProgressEvent),
    Progress(ProgressEvent),
    Done { file: String },
    Ready,
    Start,
    Update(GenerationUpdate),
    Complete,
    Error { data: String },
}

impl WorkerEvent {
    /// Wire tag, used for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Initiate(_) => "initiate",
            Self::Progress(_) => "progress",
            Self::Done { .. } => "done",
            Self::Ready => "ready",
            Self::Start => "start",
            Self::Update(_) => "update",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn loading(message: impl Into<String>) -> Self {
        Self::Loading {
            data: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: message.into(),
        }
    }

    pub fn done(file: impl Into<String>) -> Self {
        Self::Done { file: file.into() }
    }
}
