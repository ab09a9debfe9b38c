//! Inbound invocation dispatch.
//!
//! Handlers are looked up by target name at the moment an invocation is read
//! and then run on a per-target lane: one tokio task per target draining an
//! unbounded FIFO, handing each invocation to the blocking pool in turn.
//! Invocations for the same target run in arrival order; a slow handler only
//! delays later invocations of its own target, never the read loop or other
//! targets.
//!
//! A lane lives only while it has work. Once its queue is empty it removes
//! itself from the lane map and exits; the next invocation for that target
//! starts a fresh one.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

/// Callback for an inbound invocation: `(target, arguments)`.
pub type Handler = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Target name → handler, plus one default handler that sees everything.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
    default: RwLock<Option<Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let targets: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let has_default = self
            .default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("HandlerRegistry")
            .field("targets", &targets)
            .field("has_default", &has_default)
            .finish()
    }
}

impl HandlerRegistry {
    /// Register `handler` for `target`, replacing any previous one.
    pub fn on(&self, target: impl Into<String>, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.into(), handler);
    }

    /// Remove the handler for `target`. Returns whether one was registered.
    pub fn off(&self, target: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target)
            .is_some()
    }

    /// Replace (or clear) the default handler.
    pub fn set_default(&self, handler: Option<Handler>) {
        *self.default.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Handlers to run for `target`, default first.
    pub fn resolve(&self, target: &str) -> Vec<Handler> {
        let mut resolved = Vec::with_capacity(2);
        if let Some(default) = self
            .default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            resolved.push(Arc::clone(default));
        }
        if let Some(specific) = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            resolved.push(Arc::clone(specific));
        }
        resolved
    }
}

struct Job {
    target: String,
    arguments: Vec<Value>,
    handlers: Vec<Handler>,
}

type Lanes = Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>;

/// Fans inbound invocations out to per-target lanes.
#[derive(Debug, Default)]
pub struct Dispatcher {
    lanes: Arc<Lanes>,
}

impl Dispatcher {
    /// Queue one invocation. Must be called from inside a tokio runtime.
    ///
    /// Returns `false` when no handler is registered for it.
    pub fn dispatch(&self, registry: &HandlerRegistry, target: String, arguments: Vec<Value>) -> bool {
        let handlers = registry.resolve(&target);
        if handlers.is_empty() {
            log::debug!("[Dispatch] No handler for {target}, dropped");
            return false;
        }

        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = Job {
            target,
            arguments,
            handlers,
        };
        if let Some(lane) = lanes.get(&job.target) {
            match lane.send(job) {
                Ok(()) => return true,
                // Lane task is gone; fall through and start a fresh one.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(job.target.clone(), rx, Arc::clone(&self.lanes)));
        let target = job.target.clone();
        if tx.send(job).is_err() {
            log::error!("[Dispatch] Lane for {target} closed before first job");
            return false;
        }
        lanes.insert(target, tx);
        true
    }

    /// Number of targets with a live lane.
    pub fn lane_count(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn run_lane(lane: String, mut rx: mpsc::UnboundedReceiver<Job>, lanes: Arc<Lanes>) {
    log::trace!("[Dispatch] Lane for {lane} started");
    while let Some(job) = rx.recv().await {
        let Job {
            target,
            arguments,
            handlers,
        } = job;
        // Handlers are plain blocking callbacks; keep them off the async workers.
        let ran = tokio::task::spawn_blocking(move || {
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&target, &arguments))).is_err() {
                    log::error!("[Dispatch] Handler for {target} panicked");
                }
            }
        })
        .await;
        if let Err(e) = ran {
            log::error!("[Dispatch] Handler task for {lane} failed: {e}");
        }

        // Dispatch only sends while holding this lock, so an empty queue
        // seen here stays empty until the entry is gone.
        let idle = {
            let mut map = lanes.lock().unwrap_or_else(PoisonError::into_inner);
            let idle = rx.is_empty();
            if idle {
                map.remove(&lane);
            }
            idle
        };
        if idle {
            break;
        }
    }
    log::trace!("[Dispatch] Lane for {lane} stopped");
}
