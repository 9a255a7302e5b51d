use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How a loop ended when its set was joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Finished,
    Panicked(String),
    /// Overran the join deadline and was aborted.
    Aborted,
}

struct NamedLoop {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// A group of long-running named tasks that are joined together.
#[derive(Default)]
pub struct LoopSet {
    loops: Vec<NamedLoop>,
}

impl LoopSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `fut` on the runtime under `name`.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            debug!(task = name, "loop started");
            fut.await;
            debug!(task = name, "loop exited");
        });
        self.loops.push(NamedLoop { name, handle });
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.loops.iter().map(|l| l.name)
    }

    /// Wait for every loop until `deadline`; anything still running after
    /// that is aborted.
    pub async fn join_until(self, deadline: Instant) -> Vec<(&'static str, LoopExit)> {
        let mut exits = Vec::with_capacity(self.loops.len());
        for NamedLoop { name, mut handle } in self.loops {
            let exit = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => LoopExit::Finished,
                Ok(Err(e)) if e.is_panic() => {
                    warn!(task = name, "loop panicked: {e}");
                    LoopExit::Panicked(e.to_string())
                }
                Ok(Err(_)) => LoopExit::Aborted,
                Err(_) => {
                    warn!(task = name, "loop did not exit in time, aborting");
                    handle.abort();
                    LoopExit::Aborted
                }
            };
            exits.push((name, exit));
        }
        exits
    }
}

/// Run a consumer callback, containing any panic it raises so the calling
/// loop keeps going. Returns `false` if the callback panicked.
pub(crate) fn call_handler(what: &'static str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(handler = what, "handler panicked: {}", panic_message(&*payload));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl std::fmt::Debug for LoopSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
