use ember_protocol::{GenerationPhase, Role, Turn};
use snafu::{Snafu, ensure};

/// Precondition violations on transcript mutation.
///
/// These are programming defects in the caller, never user-facing failures.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TranscriptError {
    #[snafu(display("user turn text must not be blank"))]
    EmptyUserText { stage: &'static str },
    #[snafu(display("an assistant turn is still open at index {index}"))]
    TurnStillOpen { stage: &'static str, index: usize },
    #[snafu(display("no open assistant turn to append to"))]
    NoOpenAssistantTurn { stage: &'static str },
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// Ordered conversation turns, mutated append-only while generation streams in.
///
/// At most the last turn is open; every earlier turn is frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    turns: Vec<Turn>,
    open_index: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The assistant turn currently receiving streamed output, if any.
    pub fn open_turn(&self) -> Option<&Turn> {
        self.open_index.and_then(|index| self.turns.get(index))
    }

    pub fn has_user_turn(&self) -> bool {
        self.turns.iter().any(|turn| turn.role == Role::User)
    }

    /// Dispatch gate for `generate`: history holds a user turn and the last turn
    /// is not an assistant reply.
    pub fn awaits_reply(&self) -> bool {
        self.has_user_turn() && self.last().is_some_and(|turn| !turn.is_assistant())
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> TranscriptResult<()> {
        let text = text.into();
        ensure!(
            !text.trim().is_empty(),
            EmptyUserTextSnafu {
                stage: "append-user"
            }
        );
        self.ensure_closed("append-user")?;

        self.turns.push(Turn::user(text));
        Ok(())
    }

    /// Appends the empty assistant turn for one generation cycle and opens it.
    pub fn begin_assistant_turn(&mut self) -> TranscriptResult<()> {
        self.ensure_closed("begin-assistant-turn")?;

        self.turns.push(Turn::assistant_placeholder());
        self.open_index = Some(self.turns.len() - 1);
        Ok(())
    }

    /// Concatenates streamed output onto the open assistant turn.
    ///
    /// The first chunk reported in the answering phase records the answer boundary
    /// at the content length before that chunk; later phase changes never move it.
    pub fn append_to_last_turn(
        &mut self,
        delta: &str,
        phase: GenerationPhase,
    ) -> TranscriptResult<()> {
        let last_index = self.turns.len().checked_sub(1);
        let turn = match (self.open_index, last_index) {
            (Some(open), Some(last)) if open == last => &mut self.turns[open],
            _ => {
                return NoOpenAssistantTurnSnafu {
                    stage: "append-to-last-turn",
                }
                .fail();
            }
        };

        if phase == GenerationPhase::Answering && turn.answer_index.is_none() {
            turn.answer_index = Some(turn.content.len());
        }
        turn.content.push_str(delta);
        Ok(())
    }

    /// Freezes the open turn. Returns `false` when nothing was open.
    pub fn close_open_turn(&mut self) -> bool {
        self.open_index.take().is_some()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.open_index = None;
    }

    /// Drops turns past `len`, undoing appends that were never acted on.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
        if self.open_index.is_some_and(|index| index >= len) {
            self.open_index = None;
        }
    }

    fn ensure_closed(&self, stage: &'static str) -> TranscriptResult<()> {
        match self.open_index {
            Some(index) => TurnStillOpenSnafu { stage, index }.fail(),
            None => Ok(()),
        }
    }
}
