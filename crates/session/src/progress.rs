use ember_protocol::ProgressEvent;
use serde::Serialize;

/// Load progress for one resource while the model initializes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressItem {
    pub file: String,
    pub name: Option<String>,
    /// Percentage in `0..=100`.
    pub progress: f64,
    pub loaded: Option<u64>,
    pub total: Option<u64>,
}

impl ProgressItem {
    fn from_event(event: ProgressEvent) -> Self {
        Self {
            file: event.file,
            name: event.name,
            progress: event.progress.unwrap_or(0.0).clamp(0.0, 100.0),
            loaded: event.loaded,
            total: event.total,
        }
    }

    fn merge(&mut self, event: ProgressEvent) {
        if let Some(name) = event.name {
            self.name = Some(name);
        }
        if let Some(progress) = event.progress {
            self.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(loaded) = event.loaded {
            self.loaded = Some(loaded);
        }
        if let Some(total) = event.total {
            self.total = Some(total);
        }
    }
}

/// Live set of in-flight load resources, keyed by `file`, in initiation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressAggregator {
    items: Vec<ProgressItem>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ProgressItem] {
        &self.items
    }

    pub fn get(&self, file: &str) -> Option<&ProgressItem> {
        self.items.iter().find(|item| item.file == file)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Starts tracking a resource. A duplicate `file` is ignored and returns `false`.
    pub fn on_initiate(&mut self, event: ProgressEvent) -> bool {
        if self.get(&event.file).is_some() {
            tracing::debug!(file = %event.file, "ignoring duplicate progress initiate");
            return false;
        }

        self.items.push(ProgressItem::from_event(event));
        true
    }

    /// Merges a progress record into its item. Records for untracked files are dropped.
    pub fn on_progress(&mut self, event: ProgressEvent) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.file == event.file) else {
            tracing::trace!(file = %event.file, "dropping progress for untracked file");
            return false;
        };

        item.merge(event);
        true
    }

    /// Stops tracking a finished resource. Unknown keys are a no-op.
    pub fn on_done(&mut self, file: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.file != file);
        before != self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_for_never_initiated_file_leaves_set_unchanged() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.on_initiate(ProgressEvent::new("a"));
        let before = aggregator.clone();

        for step in 0..5 {
            let applied = aggregator
                .on_progress(ProgressEvent::new("ghost").with_progress(f64::from(step) * 20.0));
            assert!(!applied);
        }

        assert_eq!(aggregator, before);
    }

    #[test]
    fn done_removes_only_the_matching_file() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.on_initiate(ProgressEvent::new("a"));
        aggregator.on_initiate(ProgressEvent::new("b"));

        assert!(aggregator.on_done("a"));

        let files = aggregator
            .items()
            .iter()
            .map(|item| item.file.as_str())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["b"]);
    }

    #[test]
    fn duplicate_initiate_is_a_no_op() {
        let mut aggregator = ProgressAggregator::new();
        assert!(aggregator.on_initiate(ProgressEvent::new("a").with_progress(10.0)));
        assert!(!aggregator.on_initiate(ProgressEvent::new("a").with_progress(90.0)));

        assert_eq!(aggregator.items().len(), 1);
        assert_eq!(aggregator.get("a").map(|item| item.progress), Some(10.0));
    }

    #[test]
    fn progress_overwrites_present_fields_and_keeps_others() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.on_initiate(ProgressEvent::new("model.onnx").with_name("qwen3"));

        aggregator.on_progress(ProgressEvent::new("model.onnx").with_bytes(512, 2048));
        aggregator.on_progress(ProgressEvent::new("model.onnx").with_progress(25.0));

        let item = aggregator.get("model.onnx").unwrap();
        assert_eq!(item.name.as_deref(), Some("qwen3"));
        assert_eq!(item.progress, 25.0);
        assert_eq!(item.loaded, Some(512));
        assert_eq!(item.total, Some(2048));
    }

    #[test]
    fn done_for_unknown_file_is_a_no_op() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.on_initiate(ProgressEvent::new("a"));
        assert!(!aggregator.on_done("b"));
        assert_eq!(aggregator.items().len(), 1);
    }
}
