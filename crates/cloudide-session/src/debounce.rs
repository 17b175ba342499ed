use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cloudide_protocol::encode_content;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives the single write produced by a quiet period.
pub trait MutationSink: Send + Sync + 'static {
    /// `encoded` is the document content after [`encode_content`].
    fn flush(&self, path: &str, encoded: String);
}

impl<F> MutationSink for F
where
    F: Fn(&str, String) + Send + Sync + 'static,
{
    fn flush(&self, path: &str, encoded: String) {
        self(path, encoded)
    }
}

struct Pending {
    generation: u64,
    content: String,
    timer: JoinHandle<()>,
}

struct Inner<S> {
    sink: S,
    quiet: Duration,
    generation: AtomicU64,
    pending: Mutex<HashMap<String, Pending>>,
}

/// Coalesces bursts of edits per document into one trailing write.
///
/// Each path is either idle or pending with exactly one live timer and the
/// newest content. A new edit replaces both; intermediate contents are
/// never sent. Dropping the debouncer discards everything still pending.
pub struct Debouncer<S: MutationSink> {
    inner: Arc<Inner<S>>,
}

impl<S: MutationSink> Debouncer<S> {
    pub fn new(sink: S, quiet: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                quiet,
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet
    }

    pub fn sink(&self) -> &S {
        &self.inner.sink
    }

    /// Record the latest content of `path` and restart its quiet period.
    pub fn edit(&self, path: impl Into<String>, content: impl Into<String>) {
        let path = path.into();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Held across spawn so the timer cannot look up its entry early.
        let mut pending = self.inner.pending.lock();
        let timer = tokio::spawn(fire(
            Arc::downgrade(&self.inner),
            path.clone(),
            generation,
            self.inner.quiet,
        ));
        let previous = pending.insert(
            path.clone(),
            Pending {
                generation,
                content: content.into(),
                timer,
            },
        );
        drop(pending);
        if let Some(previous) = previous {
            previous.timer.abort();
        }
        debug!(%path, generation, "document edit pending");
    }

    /// Drop the pending edit for `path` without sending it.
    pub fn discard(&self, path: &str) -> bool {
        let removed = self.inner.pending.lock().remove(path);
        match removed {
            Some(pending) => {
                pending.timer.abort();
                debug!(%path, "pending document edit discarded");
                true
            }
            None => false,
        }
    }

    /// Drop every pending edit. Returns how many were lost.
    pub fn discard_all(&self) -> usize {
        let drained: Vec<Pending> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in &drained {
            pending.timer.abort();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "pending document edits discarded");
        }
        drained.len()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.inner.pending.lock().contains_key(path)
    }

    pub fn pending_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.pending.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl<S: MutationSink> Drop for Debouncer<S> {
    fn drop(&mut self) {
        self.discard_all();
    }
}

async fn fire<S: MutationSink>(inner: Weak<Inner<S>>, path: String, generation: u64, quiet: Duration) {
    tokio::time::sleep(quiet).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let content = {
        let mut pending = inner.pending.lock();
        match pending.get(&path) {
            Some(entry) if entry.generation == generation => {
                pending.remove(&path).map(|entry| entry.content)
            }
            _ => None,
        }
    };
    match content {
        Some(content) => {
            debug!(%path, generation, "flushing document edit");
            inner.sink.flush(&path, encode_content(&content));
        }
        None => debug!(%path, generation, "superseded debounce timer"),
    }
}
