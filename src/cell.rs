//! Data guarded by an arbiter resource

use std::cell::UnsafeCell;
use std::time::Duration;

use crate::arbiter::Arbiter;
use crate::error::ArbiterError;
use crate::registry::ResourceId;
use crate::task::TaskId;

/// Value that may only be touched while its resource is held through the arbiter
pub struct ResourceCell<'a, T> {
    arbiter: &'a Arbiter,
    resource: ResourceId,
    data: UnsafeCell<T>,
}

// Access to `data` is serialized by the resource lock of the arbiter
unsafe impl<T: Send> Sync for ResourceCell<'_, T> {}

impl Arbiter {
    /// Puts `value` under the protection of `resource`
    pub fn protect<T>(
        &self,
        resource: ResourceId,
        value: T,
    ) -> Result<ResourceCell<'_, T>, ArbiterError> {
        self.registry().get(resource)?;

        Ok(ResourceCell {
            arbiter: self,
            resource,
            data: UnsafeCell::new(value),
        })
    }
}

impl<'a, T> ResourceCell<'a, T> {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Proxy through which `task` locks the value
    pub fn access(&self, task: TaskId) -> Shared<'_, 'a, T> {
        Shared { cell: self, task }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Per task handle to a [`ResourceCell`]
pub struct Shared<'c, 'a, T> {
    cell: &'c ResourceCell<'a, T>,
    task: TaskId,
}

impl<T> Shared<'_, '_, T> {
    /// Runs `f` with the resource held, waiting at most `timeout` to get it
    pub fn try_lock<R>(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ArbiterError> {
        let arbiter = self.cell.arbiter;
        let resource = self.cell.resource;

        arbiter.acquire_guarded(resource, self.task, timeout)?;
        let held = Held {
            arbiter,
            resource,
            task: self.task,
        };

        #[cfg(feature = "profiling")]
        let _span = tracing::span!(tracing::Level::TRACE, "locked", resource = resource.name())
            .entered();

        // The resource is held, acquisition is not reentrant and only this call can release a
        // guarded record, so this is the only reference
        let r = f(unsafe { &mut *self.cell.data.get() });

        std::mem::forget(held);
        arbiter.release_guarded(resource, self.task)?;

        Ok(r)
    }
}

impl<T> rtic_core::Mutex for Shared<'_, '_, T> {
    type T = T;

    fn lock<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        match self.try_lock(None, f) {
            Ok(r) => r,
            Err(e) => panic!("lock of resource {} failed: {}", self.cell.resource, e),
        }
    }
}

/// Releases the resource if the closure unwinds
struct Held<'a> {
    arbiter: &'a Arbiter,
    resource: ResourceId,
    task: TaskId,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.arbiter.release_guarded(self.resource, self.task) {
            tracing::error!(resource = self.resource.name(), "release after panic failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemorySink;
    use crate::registry::ResourceRegistry;
    use crate::task::SimulatedPriority;
    use rtic_core::Mutex as _;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;

    const COUNTER: ResourceId = ResourceId::new("counter");

    fn arbiter() -> Arbiter {
        let registry = ResourceRegistry::new().with(COUNTER, 3).unwrap();
        Arbiter::with_sink(registry, MemorySink::new())
    }

    #[test]
    fn lock_boosts_while_inside() {
        let arbiter = arbiter();
        let task = arbiter.register_task("task", SimulatedPriority::new(1));
        let cell = arbiter.protect(COUNTER, 0u32).unwrap();

        let prio = cell.access(task).lock(|count| {
            *count += 1;
            arbiter.priority(task).unwrap()
        });

        assert_eq!(prio, 3);
        assert_eq!(arbiter.priority(task).unwrap(), 1);
        assert_eq!(cell.into_inner(), 1);
    }

    #[test]
    fn concurrent_increments() {
        let arbiter = arbiter();
        let cell = arbiter.protect(COUNTER, 0u32).unwrap();

        thread::scope(|s| {
            for prio in 1..=3 {
                let arbiter = &arbiter;
                let cell = &cell;
                s.spawn(move || {
                    let task = arbiter.register_task("inc", SimulatedPriority::new(prio));
                    let mut shared = cell.access(task);
                    for _ in 0..100 {
                        shared.lock(|count| *count += 1);
                    }
                });
            }
        });

        assert_eq!(cell.into_inner(), 300);
    }

    #[test]
    fn nested_lock_of_same_resource_fails() {
        let arbiter = arbiter();
        let task = arbiter.register_task("task", SimulatedPriority::new(1));
        let cell = arbiter.protect(COUNTER, 0u32).unwrap();
        let other = arbiter.protect(COUNTER, 0u32).unwrap();

        let inner = cell
            .access(task)
            .try_lock(None, |_| other.access(task).try_lock(None, |_| ()))
            .unwrap();

        assert!(matches!(inner, Err(ArbiterError::AlreadyOwned { .. })));
        assert_eq!(arbiter.owner(COUNTER).unwrap(), None);
    }

    #[test]
    fn panic_inside_releases() {
        let arbiter = arbiter();
        let task = arbiter.register_task("task", SimulatedPriority::new(1));
        let cell = arbiter.protect(COUNTER, 0u32).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            cell.access(task).lock(|_| panic!("boom"));
        }));

        assert!(result.is_err());
        assert_eq!(arbiter.owner(COUNTER).unwrap(), None);
        assert_eq!(arbiter.priority(task).unwrap(), 1);
    }

    #[test]
    fn data_stays_exclusive_when_closure_releases_directly() {
        let arbiter = arbiter();
        let t1 = arbiter.register_task("t1", SimulatedPriority::new(1));
        let t2 = arbiter.register_task("t2", SimulatedPriority::new(2));
        let cell = arbiter.protect(COUNTER, 0u32).unwrap();

        let (released, second) = cell
            .access(t1)
            .try_lock(None, |count| {
                *count += 1;
                let released = arbiter.release(COUNTER, t1);
                let second = cell
                    .access(t2)
                    .try_lock(Some(Duration::ZERO), |count| *count += 1);
                (released, second)
            })
            .unwrap();

        assert!(matches!(released, Err(ArbiterError::Guarded { .. })));
        assert!(matches!(second, Err(ArbiterError::TimedOut { .. })));
        assert_eq!(arbiter.owner(COUNTER).unwrap(), None);
        assert_eq!(arbiter.priority(t1).unwrap(), 1);
        assert_eq!(cell.into_inner(), 1);
    }

    #[test]
    fn protect_undefined_resource_fails() {
        let arbiter = arbiter();
        assert!(matches!(
            arbiter.protect(ResourceId::new("missing"), ()),
            Err(ArbiterError::InvalidResource(_))
        ));
    }
}
