#![deny(unsafe_code)]

//! Generation session state machine.
//!
//! A [`SessionController`] owns the transcript, load progress and run state,
//! and turns the ordered event stream of an inference worker into snapshots
//! the presentation layer can render. [`SessionRuntime`] drives it from one
//! task so worker events and user intents are never processed concurrently.
pub mod controller;
/// Scroll and input sizing helpers for presentation hosts.
pub mod coordinators;
pub mod error;
pub mod progress;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod transcript;

pub use controller::{ControllerConfig, DEFAULT_INTERRUPT_TIMEOUT, SessionController};
pub use error::{SessionError, SessionResult};
pub use progress::{ProgressAggregator, ProgressItem};
pub use runtime::{SessionClient, SessionIntent, SessionRuntime};
pub use snapshot::{SnapshotPublisher, SnapshotReader, snapshot_channel};
pub use state::{Metrics, RunState, SessionSnapshot, SessionStatus};
pub use transcript::{Transcript, TranscriptError, TranscriptResult};
