//! Inference worker backed by an OpenAI-compatible provider through rig.
//!
//! The worker speaks the command/event protocol from `ember-protocol` and is
//! the only place that performs provider IO.
mod catalog;
mod config;
mod stream;
mod worker;

pub use catalog::{CATALOG_RESOURCE, ModelCatalog, extract_model_ids, fetch_catalog};
pub use config::{DEFAULT_MODEL_ID, WorkerConfig, WorkerError, WorkerResult};
pub use stream::{StreamDelta, TokenMeter, to_rig_messages};
pub use worker::{CancelReason, run_worker, spawn_worker};
