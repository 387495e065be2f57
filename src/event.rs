//! Diagnostic events emitted on every acquire and release decision

use parking_lot::Mutex;

use crate::registry::ResourceId;
use crate::task::TaskId;
use crate::Priority;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterEvent {
    /// `task` took `resource`. Its priority went from `from` to `to`.
    Acquired {
        task: TaskId,
        name: &'static str,
        resource: ResourceId,
        ceiling: Priority,
        from: Priority,
        to: Priority,
    },
    /// `task` gave back `resource` and its priority was restored from `from` to `to`.
    Released {
        task: TaskId,
        name: &'static str,
        resource: ResourceId,
        from: Priority,
        to: Priority,
    },
}

impl ArbiterEvent {
    pub fn task(&self) -> TaskId {
        match *self {
            ArbiterEvent::Acquired { task, .. } | ArbiterEvent::Released { task, .. } => task,
        }
    }

    pub fn changes_priority(&self) -> bool {
        match *self {
            ArbiterEvent::Acquired { from, to, .. } | ArbiterEvent::Released { from, to, .. } => {
                from != to
            }
        }
    }
}

/// Destination of arbiter events.
///
/// Called inside the arbiter's critical section, so implementations must return quickly and
/// must not call back into the arbiter.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &ArbiterEvent);
}

/// Writes one log line per decision through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ArbiterEvent) {
        match *event {
            ArbiterEvent::Acquired {
                name,
                resource,
                ceiling,
                from,
                to,
                ..
            } => {
                if from == to {
                    tracing::info!(
                        task = name,
                        resource = resource.name(),
                        from,
                        ceiling,
                        "task {} acquired resource {} and keeps its priority of {} instead of changing to {}",
                        name, resource, from, ceiling
                    );
                } else {
                    tracing::info!(
                        task = name,
                        resource = resource.name(),
                        from,
                        to,
                        "task {} acquired resource {} and changed its priority from {} to {}",
                        name, resource, from, to
                    );
                }
            }
            ArbiterEvent::Released {
                name,
                resource,
                from,
                to,
                ..
            } => {
                tracing::info!(
                    task = name,
                    resource = resource.name(),
                    from,
                    to,
                    "task {} released resource {} and changed its priority from {} to {}",
                    name, resource, from, to
                );
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ArbiterEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ArbiterEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ArbiterEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &ArbiterEvent) {
        self.events.lock().push(*event);
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn record(&self, event: &ArbiterEvent) {
        (**self).record(event)
    }
}
