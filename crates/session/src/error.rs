use snafu::Snafu;

use crate::state::SessionStatus;
use crate::transcript::TranscriptError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("session is not ready (status: {status})"))]
    NotReady {
        stage: &'static str,
        status: SessionStatus,
    },
    #[snafu(display("model load was already requested (status: {status})"))]
    LoadAlreadyRequested {
        stage: &'static str,
        status: SessionStatus,
    },
    #[snafu(display("a generation is already in flight"))]
    AlreadyRunning { stage: &'static str },
    #[snafu(display("no generation is in flight"))]
    NotRunning { stage: &'static str },
    #[snafu(display("transcript rejected mutation on `{stage}`: {source}"))]
    Transcript {
        stage: &'static str,
        source: TranscriptError,
    },
    #[snafu(display("inference worker is unavailable, dropped `{command}` command"))]
    WorkerUnavailable {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("session runtime has shut down"))]
    RuntimeClosed { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;
