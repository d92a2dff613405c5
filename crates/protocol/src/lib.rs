//! Wire contract between the session controller and an inference worker.
pub mod channel;
pub mod events;
pub mod message;

pub use channel::{
    CommandReceiver, CommandSender, EventReceiver, EventSender, WorkerEndpoint, WorkerGuard,
    WorkerHandle, worker_channel,
};
pub use events::{
    GenerateRequest, GenerationPhase, GenerationUpdate, ProgressEvent, WorkerCommand, WorkerEvent,
};
pub use message::{Role, Turn};
