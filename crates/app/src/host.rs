use std::collections::HashMap;
use std::io::BufRead;

use ember_protocol::Turn;
use ember_session::{SessionClient, SessionError, SessionSnapshot, SessionStatus, SnapshotReader};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::settings::SettingsStore;

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

pub const HELP: &str =
    "commands: /load  /reason [on|off]  /try <n>  /stop  /reset  /help  /quit\n";

/// Offered while the conversation is empty; `/try <n>` submits one.
pub const STARTER_PROMPTS: [&str; 3] = [
    "Solve the equation x^2 - 3x + 2 = 0",
    "Lily is three times as old as her son. In 15 years she will be twice his age. How old is she now?",
    "Write Python code to compute the nth Fibonacci number.",
];

// Window title escape; the terminal shows it outside the transcript.
const TITLE_PREFIX: &str = "\x1b]0;";
const TITLE_SUFFIX: &str = "\x07";
const TITLE: &str = "ember";

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HostError {
    #[snafu(display("failed to write terminal output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Load,
    /// `None` toggles the current mode.
    Reason(Option<bool>),
    /// One-based index into [`STARTER_PROMPTS`].
    Try(usize),
    Stop,
    Reset,
    Help,
    Quit,
    Submit(String),
    Unknown(String),
}

/// Parses one input line. Blank lines yield nothing.
pub fn parse_line(line: &str) -> Option<HostCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(command) = line.strip_prefix('/') else {
        return Some(HostCommand::Submit(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let argument = parts.next();
    let parsed = match (name, argument, parts.next()) {
        ("load", None, None) => HostCommand::Load,
        ("reason", None, None) => HostCommand::Reason(None),
        ("reason", Some("on"), None) => HostCommand::Reason(Some(true)),
        ("reason", Some("off"), None) => HostCommand::Reason(Some(false)),
        ("try", Some(index), None) => match index.parse::<usize>() {
            Ok(index) if (1..=STARTER_PROMPTS.len()).contains(&index) => HostCommand::Try(index),
            _ => HostCommand::Unknown(line.to_string()),
        },
        ("stop", None, None) => HostCommand::Stop,
        ("reset", None, None) => HostCommand::Reset,
        ("help", None, None) => HostCommand::Help,
        ("quit" | "exit", None, None) => HostCommand::Quit,
        _ => HostCommand::Unknown(line.to_string()),
    };
    Some(parsed)
}

/// Reads stdin lines on a dedicated thread.
///
/// Blocking reads stay off the runtime so shutdown never waits on the terminal.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "stopped reading terminal input");
                    break;
                }
            }
        }
    });
    line_rx
}

/// Turns successive snapshots into terminal output, writing only what changed.
#[derive(Debug, Default)]
pub struct Renderer {
    status: SessionStatus,
    loading_message: String,
    progress: HashMap<String, u32>,
    error: Option<String>,
    running: bool,
    // Transcript length at which the last reply footer was written.
    footer_at: Option<usize>,
    // Rate currently shown in the window title while a reply streams.
    live_rate: Option<String>,
    suggested: bool,
    turn_count: usize,
    // Index of the first turn that may still grow, and the part of it already written.
    next_turn: usize,
    written: String,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, snapshot: &SessionSnapshot) -> String {
        let mut out = String::new();
        self.render_loading(snapshot, &mut out);
        self.render_live_rate(snapshot, &mut out);
        self.render_turns(&snapshot.turns, &mut out);
        self.render_suggestions(snapshot, &mut out);
        self.render_completion(snapshot, &mut out);
        self.render_error(snapshot, &mut out);
        out
    }

    fn render_loading(&mut self, snapshot: &SessionSnapshot, out: &mut String) {
        if snapshot.loading_message != self.loading_message {
            if !snapshot.loading_message.is_empty() {
                out.push_str(&format!("{}\n", snapshot.loading_message));
            }
            self.loading_message = snapshot.loading_message.clone();
        }

        for item in &snapshot.progress_items {
            let percent = item.progress.floor() as u32;
            if self.progress.insert(item.file.clone(), percent) != Some(percent) {
                match &item.name {
                    Some(name) => out.push_str(&format!("  {name} ({}) {percent}%\n", item.file)),
                    None => out.push_str(&format!("  {} {percent}%\n", item.file)),
                }
            }
        }
        self.progress.retain(|file, _| {
            let live = snapshot.progress_items.iter().any(|item| &item.file == file);
            if !live {
                out.push_str(&format!("  {file} done\n"));
            }
            live
        });

        if snapshot.status != self.status {
            if snapshot.status == SessionStatus::Ready {
                out.push_str("Model ready. Type a message, or /help.\n");
            }
            self.status = snapshot.status;
        }
    }

    fn render_turns(&mut self, turns: &[Turn], out: &mut String) {
        let rewound = turns.len() < self.turn_count
            || turns
                .get(self.next_turn)
                .is_some_and(|turn| !turn.content.starts_with(self.written.as_str()));
        if rewound {
            if self.running && !self.written.is_empty() {
                out.push('\n');
            }
            out.push_str("--- new conversation ---\n");
            self.footer_at = None;
            self.next_turn = 0;
            self.written.clear();
        }
        self.turn_count = turns.len();

        for (index, turn) in turns.iter().enumerate().skip(self.next_turn) {
            // User turns were typed into the terminal already.
            if turn.is_assistant() {
                write_assistant_delta(turn, self.written.len(), out);
            }

            if index + 1 < turns.len() {
                self.next_turn = index + 1;
                self.written.clear();
            } else if turn.is_assistant() {
                self.written = turn.content.clone();
            } else {
                self.written.clear();
            }
        }
    }

    fn render_live_rate(&mut self, snapshot: &SessionSnapshot, out: &mut String) {
        if !snapshot.is_running() {
            return;
        }
        let Some(tps) = snapshot.metrics.tokens_per_second else {
            return;
        };

        let rate = format!("{tps:.2} tokens/s");
        if self.live_rate.as_deref() != Some(rate.as_str()) {
            out.push_str(&format!("{TITLE_PREFIX}{TITLE} - {rate}{TITLE_SUFFIX}"));
            self.live_rate = Some(rate);
        }
    }

    fn render_suggestions(&mut self, snapshot: &SessionSnapshot, out: &mut String) {
        if !snapshot.turns.is_empty() {
            self.suggested = false;
            return;
        }
        if self.suggested || snapshot.status != SessionStatus::Ready {
            return;
        }

        self.suggested = true;
        out.push_str("Try one of these with /try <n>:\n");
        for (index, prompt) in STARTER_PROMPTS.iter().enumerate() {
            out.push_str(&format!("  {}. {prompt}\n", index + 1));
        }
    }

    /// Closes a finished reply with a newline and its metrics. Snapshots may be
    /// coalesced, so this keys off the idle transcript rather than an observed
    /// run-state transition.
    fn render_completion(&mut self, snapshot: &SessionSnapshot, out: &mut String) {
        self.running = snapshot.is_running();
        let finished = !self.running
            && snapshot.turns.last().is_some_and(Turn::is_assistant)
            && self.footer_at != Some(snapshot.turns.len());
        if !finished {
            return;
        }

        self.footer_at = Some(snapshot.turns.len());
        out.push('\n');
        if self.live_rate.take().is_some() {
            out.push_str(&format!("{TITLE_PREFIX}{TITLE}{TITLE_SUFFIX}"));
        }
        let metrics = snapshot.metrics;
        if let (Some(count), Some(tps), Some(secs)) = (
            metrics.token_count,
            metrics.tokens_per_second,
            metrics.elapsed_secs(),
        ) {
            out.push_str(&format!(
                "{DIM}[{count} tokens in {secs:.2}s, {tps:.2} tokens/s]{RESET}\n"
            ));
        }
    }

    fn render_error(&mut self, snapshot: &SessionSnapshot, out: &mut String) {
        if snapshot.error != self.error {
            if let Some(error) = &snapshot.error {
                out.push_str(&format!("error: {error}\n"));
            }
            self.error = snapshot.error.clone();
        }
    }
}

/// Writes the part of `turn` past `from`; text before the answer boundary is dimmed.
///
/// Without a recorded boundary everything streamed so far is reasoning.
fn write_assistant_delta(turn: &Turn, from: usize, out: &mut String) {
    let content = turn.content.as_str();
    let boundary = turn.answer_index.unwrap_or(content.len()).min(content.len());

    if from < boundary
        && let Some(reasoning) = content.get(from..boundary)
    {
        out.push_str(DIM);
        out.push_str(reasoning);
        out.push_str(RESET);
    }

    if let Some(answer) = content.get(from.max(boundary)..) {
        out.push_str(answer);
    }
}

fn describe(error: &SessionError) -> String {
    match error {
        SessionError::NotReady {
            status: SessionStatus::Unset,
            ..
        } => "model is not loaded, type /load first".to_string(),
        SessionError::NotReady { .. } => "model is still loading".to_string(),
        SessionError::AlreadyRunning { .. } => {
            "a reply is still streaming, /stop it first".to_string()
        }
        SessionError::NotRunning { .. } => "nothing to stop".to_string(),
        other => other.to_string(),
    }
}

/// Line-oriented terminal front end for one session.
pub struct Host<'a, W> {
    client: SessionClient,
    snapshots: SnapshotReader,
    settings: &'a SettingsStore,
    renderer: Renderer,
    output: W,
}

impl<'a, W> Host<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(
        client: SessionClient,
        snapshots: SnapshotReader,
        settings: &'a SettingsStore,
        output: W,
    ) -> Self {
        Self {
            client,
            snapshots,
            settings,
            renderer: Renderer::new(),
            output,
        }
    }

    /// Runs until `/quit`, end of input or the session going away. Returns the writer.
    pub async fn run(mut self, mut lines: mpsc::UnboundedReceiver<String>) -> HostResult<W> {
        self.write(HELP).await?;
        let initial = self.renderer.render(&self.snapshots.load());
        self.write(&initial).await?;

        loop {
            tokio::select! {
                // Pending snapshots are drawn before the next input line is handled.
                biased;

                snapshot = self.snapshots.changed() => {
                    let Some(snapshot) = snapshot else {
                        tracing::warn!("session stopped publishing snapshots");
                        break;
                    };
                    let rendered = self.renderer.render(&snapshot);
                    self.write(&rendered).await?;
                }
                line = lines.recv() => {
                    let Some(line) = line else {
                        break;
                    };
                    let Some(command) = parse_line(&line) else {
                        continue;
                    };
                    if !self.dispatch(command).await? {
                        break;
                    }
                }
            }
        }

        self.output.flush().await.context(WriteOutputSnafu {
            stage: "flush-on-exit",
        })?;
        Ok(self.output)
    }

    /// Returns whether the host should keep running.
    async fn dispatch(&mut self, command: HostCommand) -> HostResult<bool> {
        tracing::debug!(command = ?command, "terminal command");
        let result = match command {
            HostCommand::Quit => return Ok(false),
            HostCommand::Help => {
                self.write(HELP).await?;
                return Ok(true);
            }
            HostCommand::Unknown(line) => {
                self.write(&format!("unknown command `{line}`\n{HELP}"))
                    .await?;
                return Ok(true);
            }
            HostCommand::Load => self.client.load().await,
            HostCommand::Stop => self.client.interrupt().await,
            HostCommand::Reset => self.client.reset().await,
            HostCommand::Submit(text) => self.client.submit(text).await,
            HostCommand::Try(index) => {
                let Some(prompt) = index
                    .checked_sub(1)
                    .and_then(|index| STARTER_PROMPTS.get(index))
                else {
                    self.write(&format!("no starter prompt #{index}\n")).await?;
                    return Ok(true);
                };
                self.write(&format!("> {prompt}\n")).await?;
                self.client.submit(*prompt).await
            }
            HostCommand::Reason(requested) => {
                let result = match requested {
                    Some(enabled) => self.client.set_reasoning(enabled).await,
                    None => self.client.toggle_reasoning().await,
                };
                if result.is_ok() {
                    // Published before the intent was acknowledged.
                    let enabled = self.snapshots.load().reason_enabled;
                    self.persist_reasoning(enabled);
                    let mode = if enabled { "on" } else { "off" };
                    self.write(&format!("reasoning {mode}\n")).await?;
                }
                result
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(error @ SessionError::RuntimeClosed { .. }) => {
                self.write(&format!("! {error}\n")).await?;
                Ok(false)
            }
            Err(error) => {
                self.write(&format!("! {}\n", describe(&error))).await?;
                Ok(true)
            }
        }
    }

    fn persist_reasoning(&self, enabled: bool) {
        let mut settings = (*self.settings.settings()).clone();
        if settings.session.reason_enabled == enabled {
            return;
        }

        settings.session.reason_enabled = enabled;
        if let Err(error) = self.settings.update(settings) {
            tracing::warn!(error = %error, "failed to persist reasoning preference");
        }
    }

    async fn write(&mut self, text: &str) -> HostResult<()> {
        if text.is_empty() {
            return Ok(());
        }

        self.output
            .write_all(text.as_bytes())
            .await
            .context(WriteOutputSnafu {
                stage: "write-output",
            })?;
        self.output.flush().await.context(WriteOutputSnafu {
            stage: "flush-output",
        })
    }
}

#[cfg(test)]
mod tests {
    use ember_protocol::Role;
    use ember_session::{Metrics, ProgressItem, RunState};

    use super::*;

    fn assistant(content: &str, answer_index: Option<usize>) -> Turn {
        Turn {
            role: Role::Assistant,
            content: content.to_string(),
            answer_index,
        }
    }

    fn progress(file: &str, percent: f64) -> ProgressItem {
        ProgressItem {
            file: file.to_string(),
            name: None,
            progress: percent,
            loaded: None,
            total: None,
        }
    }

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("/load"), Some(HostCommand::Load));
        assert_eq!(parse_line("/reason"), Some(HostCommand::Reason(None)));
        assert_eq!(
            parse_line("/reason off"),
            Some(HostCommand::Reason(Some(false)))
        );
        assert_eq!(parse_line(" /quit "), Some(HostCommand::Quit));
        assert_eq!(
            parse_line("  2+2=? "),
            Some(HostCommand::Submit("2+2=?".to_string()))
        );
        assert_eq!(
            parse_line("/reason maybe"),
            Some(HostCommand::Unknown("/reason maybe".to_string()))
        );
        assert_eq!(parse_line("/try 2"), Some(HostCommand::Try(2)));
        assert_eq!(
            parse_line("/try 4"),
            Some(HostCommand::Unknown("/try 4".to_string()))
        );
    }

    #[test]
    fn starter_prompts_offered_while_conversation_is_empty() {
        let mut renderer = Renderer::new();
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Ready,
            ..SessionSnapshot::default()
        };

        let ready = renderer.render(&snapshot);
        assert!(ready.contains("Try one of these with /try <n>:\n"));
        assert!(ready.contains(&format!("  3. {}\n", STARTER_PROMPTS[2])));
        assert_eq!(renderer.render(&snapshot), "");

        snapshot.turns = vec![Turn::user("hi"), assistant("hello", Some(0))];
        renderer.render(&snapshot);

        snapshot.turns.clear();
        let reset = renderer.render(&snapshot);
        assert!(reset.starts_with("--- new conversation ---\nTry one of these"));
    }

    #[test]
    fn live_rate_tracks_the_stream_in_the_title() {
        let mut renderer = Renderer::new();
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Ready,
            run_state: RunState::Generating,
            turns: vec![Turn::user("2+2=?"), assistant("4", Some(0))],
            metrics: Metrics {
                tokens_per_second: Some(12.5),
                token_count: Some(1),
            },
            ..SessionSnapshot::default()
        };
        renderer.render(&SessionSnapshot {
            status: SessionStatus::Ready,
            ..SessionSnapshot::default()
        });

        assert_eq!(
            renderer.render(&snapshot),
            "\x1b]0;ember - 12.50 tokens/s\x074"
        );

        snapshot.turns[1] = assistant("42", Some(0));
        assert_eq!(renderer.render(&snapshot), "2");

        snapshot.run_state = RunState::Idle;
        snapshot.metrics.token_count = Some(2);
        assert_eq!(
            renderer.render(&snapshot),
            format!("\n\x1b]0;ember\x07{DIM}[2 tokens in 0.16s, 12.50 tokens/s]{RESET}\n")
        );
    }

    #[test]
    fn progress_lines_only_on_change() {
        let mut renderer = Renderer::new();
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Loading,
            loading_message: "Loading model...".to_string(),
            progress_items: vec![progress("models", 10.0)],
            ..SessionSnapshot::default()
        };

        let first = renderer.render(&snapshot);
        assert!(first.starts_with("Loading model...\n"));
        assert!(first.contains("  models 10%\n"));
        assert_eq!(renderer.render(&snapshot), "");

        snapshot.progress_items.clear();
        snapshot.status = SessionStatus::Ready;
        let done = renderer.render(&snapshot);
        assert!(done.contains("models done"));
        assert!(done.contains("Model ready."));
    }

    #[test]
    fn streams_reasoning_dimmed_then_answer() {
        let mut renderer = Renderer::new();
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Ready,
            run_state: RunState::Generating,
            turns: vec![Turn::user("2+2=?"), assistant("let me", None)],
            ..SessionSnapshot::default()
        };
        renderer.render(&SessionSnapshot {
            status: SessionStatus::Ready,
            ..SessionSnapshot::default()
        });

        assert_eq!(renderer.render(&snapshot), format!("{DIM}let me{RESET}"));

        snapshot.turns[1] = assistant("let me think4", Some("let me think".len()));
        assert_eq!(renderer.render(&snapshot), format!("{DIM} think{RESET}4"));

        snapshot.run_state = RunState::Idle;
        snapshot.metrics = Metrics {
            tokens_per_second: Some(4.0),
            token_count: Some(2),
        };
        assert_eq!(
            renderer.render(&snapshot),
            format!("\n{DIM}[2 tokens in 0.50s, 4.00 tokens/s]{RESET}\n")
        );
    }

    #[test]
    fn reset_is_announced_and_next_reply_starts_fresh() {
        let mut renderer = Renderer::new();
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Ready,
            turns: vec![Turn::user("hi"), assistant("hello", Some(0))],
            ..SessionSnapshot::default()
        };
        renderer.render(&snapshot);

        // Reset and a new exchange land between two renders.
        snapshot.turns = vec![Turn::user("again"), assistant("welcome", Some(0))];
        let output = renderer.render(&snapshot);
        assert_eq!(output, "--- new conversation ---\nwelcome\n");
    }

    #[test]
    fn errors_print_once() {
        let mut renderer = Renderer::new();
        let snapshot = SessionSnapshot {
            error: Some("quota exceeded".to_string()),
            ..SessionSnapshot::default()
        };

        assert_eq!(renderer.render(&snapshot), "error: quota exceeded\n");
        assert_eq!(renderer.render(&snapshot), "");
    }
}
