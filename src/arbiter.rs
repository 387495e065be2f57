//! Priority Ceiling Protocol arbiter
//!
//! Every resource of the registry gets a [`BinaryLock`] and, while locked, a lock record with
//! the owning task and the priority it had right before acquiring. Acquiring raises the caller
//! to the resource ceiling, releasing puts the saved priority back.
//!
//! Bookkeeping happens under one arbiter-wide lock which plays the role of a scheduler critical
//! section: priority changes, lock record updates and the release of the resource lock are
//! never observed half done by another task going through the same arbiter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::ArbiterError;
use crate::event::{ArbiterEvent, EventSink, TracingSink};
use crate::lock::BinaryLock;
use crate::registry::{ResourceId, ResourceRegistry, Slot};
use crate::task::{PriorityControl, TaskEntry, TaskId};
use crate::Priority;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LockRecord {
    owner: TaskId,
    saved_priority: Priority,
    // Held by a `ResourceCell` closure, which has live access to the protected data
    guarded: bool,
}

struct State {
    // Indexed by resource slot
    records: Vec<Option<LockRecord>>,
    // Resources held by each task, in acquisition order
    held: Vec<Vec<Slot>>,
}

pub struct Arbiter {
    registry: ResourceRegistry,
    locks: Vec<BinaryLock>,
    tasks: RwLock<Vec<Arc<TaskEntry>>>,
    state: Mutex<State>,
    sink: Box<dyn EventSink>,
}

impl Arbiter {
    /// Creates an arbiter which logs its decisions through `tracing`
    pub fn new(registry: ResourceRegistry) -> Self {
        Self::with_sink(registry, TracingSink)
    }

    pub fn with_sink(registry: ResourceRegistry, sink: impl EventSink + 'static) -> Self {
        let locks = registry.iter().map(|_| BinaryLock::new()).collect();
        let records = vec![None; registry.len()];

        Self {
            registry,
            locks,
            tasks: RwLock::new(Vec::new()),
            state: Mutex::new(State {
                records,
                held: Vec::new(),
            }),
            sink: Box::new(sink),
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Registers a task. Its current priority becomes its base priority.
    pub fn register_task(
        &self,
        name: &'static str,
        control: impl PriorityControl + 'static,
    ) -> TaskId {
        let mut tasks = self.tasks.write();
        let mut state = self.state.lock();

        let id = TaskId(tasks.len());
        tasks.push(Arc::new(TaskEntry {
            name,
            base_priority: control.priority(),
            control: Box::new(control),
        }));
        state.held.push(Vec::new());

        tracing::debug!(task = name, id = id.0, "registered task");

        id
    }

    /// Acquires `resource` for `task`, waiting at most `timeout` for it (`None` waits forever).
    ///
    /// On success the task runs at no less than the resource ceiling until it releases it.
    pub fn acquire(
        &self,
        resource: ResourceId,
        task: TaskId,
        timeout: Option<Duration>,
    ) -> Result<(), ArbiterError> {
        self.acquire_inner(resource, task, timeout, false)
    }

    /// Releases `resource` held by `task` and restores the priority it had before acquiring.
    ///
    /// Releasing a resource the task does not own, out of nesting order, or one that is held
    /// through a [`ResourceCell`](crate::ResourceCell), changes nothing.
    pub fn release(&self, resource: ResourceId, task: TaskId) -> Result<(), ArbiterError> {
        self.release_inner(resource, task, false)
    }

    /// Acquire on behalf of a cell. Only [`Arbiter::release_guarded`] can undo it.
    pub(crate) fn acquire_guarded(
        &self,
        resource: ResourceId,
        task: TaskId,
        timeout: Option<Duration>,
    ) -> Result<(), ArbiterError> {
        self.acquire_inner(resource, task, timeout, true)
    }

    pub(crate) fn release_guarded(
        &self,
        resource: ResourceId,
        task: TaskId,
    ) -> Result<(), ArbiterError> {
        self.release_inner(resource, task, true)
    }

    fn acquire_inner(
        &self,
        resource: ResourceId,
        task: TaskId,
        timeout: Option<Duration>,
        guarded: bool,
    ) -> Result<(), ArbiterError> {
        let slot = self.registry.slot(resource)?;
        let entry = self.task(task)?;

        // Would block forever on our own lock
        if let Some(record) = self.state.lock().records[slot.0] {
            if record.owner == task {
                return Err(ArbiterError::AlreadyOwned { resource, task });
            }
        }

        if !self.locks[slot.0].take(timeout) {
            tracing::debug!(task = entry.name, resource = resource.name(), "acquire timed out");
            return Err(ArbiterError::TimedOut {
                resource,
                task,
                waited: timeout.unwrap_or_default(),
            });
        }

        let mut state = self.state.lock();

        let ceiling = self.registry.by_slot(slot).ceiling;
        let current = entry.control.priority();

        let priority = if current < ceiling {
            if let Err(source) = entry.control.set_priority(ceiling) {
                self.locks[slot.0].give();
                return Err(ArbiterError::PriorityControl {
                    task,
                    priority: ceiling,
                    source,
                });
            }
            ceiling
        } else {
            current
        };

        state.records[slot.0] = Some(LockRecord {
            owner: task,
            saved_priority: current,
            guarded,
        });
        state.held[task.0].push(slot);

        self.sink.record(&ArbiterEvent::Acquired {
            task,
            name: entry.name,
            resource,
            ceiling,
            from: current,
            to: priority,
        });

        Ok(())
    }

    fn release_inner(
        &self,
        resource: ResourceId,
        task: TaskId,
        guarded: bool,
    ) -> Result<(), ArbiterError> {
        let slot = self.registry.slot(resource)?;
        let entry = self.task(task)?;

        let mut state = self.state.lock();

        let record = match state.records[slot.0] {
            Some(record) if record.owner == task => record,
            other => {
                let owner = other.map(|r| r.owner);
                tracing::warn!(
                    task = entry.name,
                    resource = resource.name(),
                    ?owner,
                    "release by non-owner rejected"
                );
                return Err(ArbiterError::NotOwner {
                    resource,
                    task,
                    owner,
                });
            }
        };

        if record.guarded && !guarded {
            tracing::warn!(
                task = entry.name,
                resource = resource.name(),
                "release of a resource held by a protected cell rejected"
            );
            return Err(ArbiterError::Guarded { resource, task });
        }

        let held = &state.held[task.0];
        if let Some(&last) = held.last() {
            if last != slot {
                let expected = self.registry.by_slot(last).id;
                tracing::warn!(
                    task = entry.name,
                    resource = resource.name(),
                    expected = expected.name(),
                    "out of order release rejected"
                );
                return Err(ArbiterError::OutOfOrder {
                    resource,
                    task,
                    expected,
                });
            }
        }

        let current = entry.control.priority();

        self.sink.record(&ArbiterEvent::Released {
            task,
            name: entry.name,
            resource,
            from: current,
            to: record.saved_priority,
        });

        state.records[slot.0] = None;
        state.held[task.0].pop();

        // Give before restoring: a waiter must not stay blocked while the releaser already runs
        // at its lower priority
        self.locks[slot.0].give();

        if current != record.saved_priority {
            if let Err(source) = entry.control.set_priority(record.saved_priority) {
                tracing::error!(
                    task = entry.name,
                    resource = resource.name(),
                    priority = record.saved_priority,
                    "resource released but priority restore failed: {}",
                    source
                );
                return Err(ArbiterError::PriorityControl {
                    task,
                    priority: record.saved_priority,
                    source,
                });
            }
        }

        Ok(())
    }

    /// Current owner of `resource`. For diagnostics only, the answer may be stale.
    pub fn owner(&self, resource: ResourceId) -> Result<Option<TaskId>, ArbiterError> {
        let slot = self.registry.slot(resource)?;
        Ok(self.state.lock().records[slot.0].map(|r| r.owner))
    }

    /// Resources currently held by `task`, oldest first
    pub fn held(&self, task: TaskId) -> Result<Vec<ResourceId>, ArbiterError> {
        self.task(task)?;
        let state = self.state.lock();
        Ok(state.held[task.0]
            .iter()
            .map(|&slot| self.registry.by_slot(slot).id)
            .collect())
    }

    /// Effective priority of `task`
    pub fn priority(&self, task: TaskId) -> Result<Priority, ArbiterError> {
        self.task(task).map(|entry| entry.control.priority())
    }

    /// Priority `task` had when it was registered, i.e. while it holds nothing
    pub fn base_priority(&self, task: TaskId) -> Result<Priority, ArbiterError> {
        self.task(task).map(|entry| entry.base_priority)
    }

    fn task(&self, task: TaskId) -> Result<Arc<TaskEntry>, ArbiterError> {
        self.tasks
            .read()
            .get(task.0)
            .cloned()
            .ok_or(ArbiterError::UnknownTask(task))
    }
}
