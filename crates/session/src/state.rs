use std::fmt;

use ember_protocol::Turn;
use serde::Serialize;

use crate::progress::ProgressItem;

/// Model lifecycle. Transitions only move forward: `Unset -> Loading -> Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Unset,
    Loading,
    Ready,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => formatter.write_str("unset"),
            Self::Loading => formatter.write_str("loading"),
            Self::Ready => formatter.write_str("ready"),
        }
    }
}

/// Whether a generation is in flight. Only meaningful once the session is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Generating,
}

impl RunState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Generating)
    }
}

/// Throughput counters reported by streamed updates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub tokens_per_second: Option<f64>,
    pub token_count: Option<u64>,
}

impl Metrics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn record(&mut self, tokens_per_second: Option<f64>, token_count: Option<u64>) {
        self.tokens_per_second = tokens_per_second;
        self.token_count = token_count;
    }

    /// Wall time implied by the counters, when both are known.
    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.token_count, self.tokens_per_second) {
            (Some(count), Some(tps)) if tps > 0.0 => Some(count as f64 / tps),
            _ => None,
        }
    }
}

/// Read-only view of the session published after every state change.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub revision: u64,
    pub status: SessionStatus,
    pub run_state: RunState,
    pub loading_message: String,
    pub error: Option<String>,
    pub progress_items: Vec<ProgressItem>,
    pub turns: Vec<Turn>,
    pub metrics: Metrics,
    pub reason_enabled: bool,
}

impl SessionSnapshot {
    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_requires_both_counters_and_positive_rate() {
        let mut metrics = Metrics::default();
        assert_eq!(metrics.elapsed_secs(), None);

        metrics.record(Some(20.0), Some(50));
        assert_eq!(metrics.elapsed_secs(), Some(2.5));

        metrics.record(Some(0.0), Some(50));
        assert_eq!(metrics.elapsed_secs(), None);

        metrics.clear();
        assert_eq!(metrics, Metrics::default());
    }
}
