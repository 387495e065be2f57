//! Task identity and the scheduler's priority control seam

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::Priority;

/// Opaque identity of a task registered with an [`Arbiter`](crate::Arbiter)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Capability to read and change the scheduled priority of one task.
///
/// The arbiter only calls `set_priority` from inside its critical section, on behalf of the
/// task that is acquiring or releasing a resource.
pub trait PriorityControl: Send + Sync {
    fn priority(&self) -> Priority;

    fn set_priority(&self, priority: Priority) -> io::Result<()>;
}

impl<P: PriorityControl + ?Sized> PriorityControl for Arc<P> {
    fn priority(&self) -> Priority {
        (**self).priority()
    }

    fn set_priority(&self, priority: Priority) -> io::Result<()> {
        (**self).set_priority(priority)
    }
}

impl<P: PriorityControl + ?Sized> PriorityControl for Box<P> {
    fn priority(&self) -> Priority {
        (**self).priority()
    }

    fn set_priority(&self, priority: Priority) -> io::Result<()> {
        (**self).set_priority(priority)
    }
}

/// Priority kept in memory only. Used when no real-time scheduler is available.
#[derive(Debug)]
pub struct SimulatedPriority(AtomicU8);

impl SimulatedPriority {
    pub fn new(priority: Priority) -> Self {
        SimulatedPriority(AtomicU8::new(priority))
    }
}

impl PriorityControl for SimulatedPriority {
    fn priority(&self) -> Priority {
        self.0.load(Ordering::Acquire)
    }

    fn set_priority(&self, priority: Priority) -> io::Result<()> {
        self.0.store(priority, Ordering::Release);
        Ok(())
    }
}

pub(crate) struct TaskEntry {
    pub(crate) name: &'static str,
    pub(crate) base_priority: Priority,
    pub(crate) control: Box<dyn PriorityControl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_priority_roundtrip() {
        let prio = SimulatedPriority::new(2);
        assert_eq!(prio.priority(), 2);

        prio.set_priority(5).unwrap();
        assert_eq!(prio.priority(), 5);
    }

    #[test]
    fn shared_control_sees_updates() {
        let prio = Arc::new(SimulatedPriority::new(3));
        let boxed: Box<dyn PriorityControl> = Box::new(prio.clone());

        boxed.set_priority(4).unwrap();
        assert_eq!(prio.priority(), 4);
    }
}
