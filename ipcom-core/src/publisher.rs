//! Hand-off of decoded snapshots to consumers.
//!
//! Two sinks are offered:
//!
//! - registered handlers, called synchronously from the engine's receive
//!   task for every snapshot, in receive order. A handler that needs a
//!   different execution context must forward the snapshot itself and must
//!   not block. A panicking handler is logged and skipped for that
//!   snapshot; it never takes the receive task down;
//! - a `watch` channel holding only the latest snapshot, for consumers
//!   that are slow and only care about the current state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;

use crate::state::StateSnapshot;
use crate::task::call_handler;

type SnapshotHandler = Arc<dyn Fn(Arc<StateSnapshot>) + Send + Sync + 'static>;

pub struct SnapshotPublisher {
    handlers: RwLock<Vec<SnapshotHandler>>,
    latest: watch::Sender<Option<Arc<StateSnapshot>>>,
    sequence: AtomicU64,
    /// Serializes publication so sequence order equals delivery order.
    order: Mutex<()>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            handlers: RwLock::new(Vec::new()),
            latest,
            sequence: AtomicU64::new(0),
            order: Mutex::new(()),
        }
    }

    /// Register a sink called for every published snapshot.
    pub fn on_snapshot<F>(&self, f: F)
    where
        F: Fn(Arc<StateSnapshot>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    /// Stamp, store as latest and deliver to every handler.
    pub fn publish(&self, snapshot: StateSnapshot) -> Arc<StateSnapshot> {
        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot.with_sequence(sequence));
        self.latest.send_replace(Some(Arc::clone(&snapshot)));

        // Clone the list so a handler may register another handler.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            let snapshot = Arc::clone(&snapshot);
            call_handler("snapshot", move || handler(snapshot));
        }
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<StateSnapshot>> {
        self.latest.borrow().clone()
    }

    /// Latest-only view; intermediate snapshots may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StateSnapshot>>> {
        self.latest.subscribe()
    }

    /// Number of snapshots published so far.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPublisher")
            .field("published", &self.published())
            .finish()
    }
}
