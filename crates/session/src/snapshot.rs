use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::state::SessionSnapshot;

/// Write half held by the controller.
pub struct SnapshotPublisher {
    current: Arc<ArcSwap<SessionSnapshot>>,
    revision: watch::Sender<u64>,
}

/// Read half handed to the presentation layer. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotReader {
    current: Arc<ArcSwap<SessionSnapshot>>,
    revision: watch::Receiver<u64>,
}

pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReader) {
    let current = Arc::new(ArcSwap::from_pointee(SessionSnapshot::default()));
    let (revision_tx, revision_rx) = watch::channel(0);
    (
        SnapshotPublisher {
            current: Arc::clone(&current),
            revision: revision_tx,
        },
        SnapshotReader {
            current,
            revision: revision_rx,
        },
    )
}

impl SnapshotPublisher {
    /// Stores a new snapshot, stamping it with the next revision.
    pub fn publish(&self, mut snapshot: SessionSnapshot) {
        let revision = self.current.load().revision.wrapping_add(1);
        snapshot.revision = revision;
        self.current.store(Arc::new(snapshot));
        self.revision.send_replace(revision);
    }
}

impl SnapshotReader {
    pub fn load(&self) -> Arc<SessionSnapshot> {
        self.current.load_full()
    }

    /// Waits for a snapshot newer than the last one observed through this reader.
    ///
    /// Returns `None` once the controller is gone.
    pub async fn changed(&mut self) -> Option<Arc<SessionSnapshot>> {
        self.revision.changed().await.ok()?;
        Some(self.load())
    }
}
