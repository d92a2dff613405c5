use ember_protocol::{GenerateRequest, GenerationPhase, Role, Turn};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::time::Instant;

use crate::catalog::build_client;
use crate::config::{CompletionsSnafu, EmptyHistorySnafu, WorkerConfig, WorkerResult};

pub(crate) type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// One streamed fragment ready to become an `update` event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub phase: GenerationPhase,
    pub text: String,
}

/// Throughput over the fragments of one generation, timed from the first fragment.
#[derive(Debug, Clone, Default)]
pub struct TokenMeter {
    first_at: Option<Instant>,
    count: u64,
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a fragment and returns `(tokens_per_second, token_count)`.
    ///
    /// The rate is unknown until time has passed since the first fragment.
    pub fn record(&mut self, now: Instant) -> (Option<f64>, u64) {
        let first_at = *self.first_at.get_or_insert(now);
        self.count += 1;

        let elapsed = now.saturating_duration_since(first_at).as_secs_f64();
        let tps = (elapsed > 0.0).then(|| self.count as f64 / elapsed);
        (tps, self.count)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Converts the transcript into provider messages.
///
/// Assistant turns contribute their answer only, so earlier reasoning is not
/// fed back to the model. Empty turns are skipped.
pub fn to_rig_messages(turns: &[Turn]) -> Vec<RigMessage> {
    turns
        .iter()
        .filter_map(|turn| match turn.role {
            Role::User if !turn.content.trim().is_empty() => {
                Some(RigMessage::user(turn.content.clone()))
            }
            Role::Assistant if !turn.answer().trim().is_empty() => {
                Some(RigMessage::assistant(turn.answer().to_string()))
            }
            _ => None,
        })
        .collect()
}

/// Splits the transcript into the prompt, taken from the final user turn, and
/// the history before it.
pub(crate) fn split_prompt(turns: &[Turn]) -> WorkerResult<(RigMessage, Vec<RigMessage>)> {
    let Some((last, earlier)) = turns.split_last() else {
        return EmptyHistorySnafu {
            stage: "split-prompt-empty",
        }
        .fail();
    };
    ensure!(
        last.role == Role::User && !last.content.trim().is_empty(),
        EmptyHistorySnafu {
            stage: "split-prompt-last-turn",
        }
    );

    Ok((
        RigMessage::user(last.content.clone()),
        to_rig_messages(earlier),
    ))
}

pub(crate) async fn open_stream(
    config: &WorkerConfig,
    request: &GenerateRequest,
) -> WorkerResult<RigStreamingResponse> {
    let client = build_client(config)?;
    let model = client.completion_model(config.model_id.clone());

    let (prompt, history) = split_prompt(&request.messages).inspect_err(|_| {
        tracing::warn!(
            model_id = %config.model_id,
            turn_count = request.messages.len(),
            "cannot open stream because the transcript does not end with a user prompt"
        );
    })?;
    let mut builder = model.completion_request(prompt).messages(history);

    if let Some(preamble) = config
        .preamble
        .as_ref()
        .filter(|preamble| !preamble.trim().is_empty())
    {
        builder = builder.preamble(preamble.clone());
    }

    if let Some(temperature) = config.temperature {
        builder = builder.temperature(temperature);
    }

    if let Some(max_tokens) = config.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }

    builder.stream().await.context(CompletionsSnafu {
        stage: "open-stream",
    })
}

/// Maps a provider chunk to a delta. Reasoning is dropped unless requested.
pub(crate) fn map_stream_item<R>(
    item: StreamedAssistantContent<R>,
    reason_enabled: bool,
) -> Option<StreamDelta>
where
    R: Clone + Unpin,
{
    let (phase, text) = match item {
        StreamedAssistantContent::Text(text) => (GenerationPhase::Answering, text.text),
        StreamedAssistantContent::Reasoning(reasoning) => {
            // Rig can split reasoning into multiple fragments.
            (GenerationPhase::Thinking, reasoning.reasoning.join(""))
        }
        StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
            (GenerationPhase::Thinking, reasoning)
        }
        StreamedAssistantContent::ToolCall { .. }
        | StreamedAssistantContent::ToolCallDelta { .. }
        | StreamedAssistantContent::Final(_) => return None,
    };

    if text.is_empty() || (phase == GenerationPhase::Thinking && !reason_enabled) {
        return None;
    }

    Some(StreamDelta { phase, text })
}
