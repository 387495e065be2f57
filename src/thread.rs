//! `SCHED_FIFO` priority control for real-time threads
//!
//! Needs root (or `CAP_SYS_NICE`). Arbiter priorities map one to one onto FIFO priorities.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, ThreadId};

use crate::task::PriorityControl;
use crate::Priority;

/// Switches the calling thread to `SCHED_FIFO` at `priority`
pub fn init_fifo_priority(priority: Priority) -> io::Result<()> {
    pcp_mutex::thread::init_fifo_priority(priority.into())
        .map(|_| ())
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("cannot set SCHED_FIFO priority {}: {:?}", priority, e),
            )
        })
}

/// Restricts the calling thread to a single CPU.
///
/// The ceiling protocol only prevents deadlock when contending tasks share one processor.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Priority control of one `SCHED_FIFO` thread.
///
/// The scheduler only offers priority changes of the calling thread, so every change has to be
/// made from the thread that created the control. The arbiter does exactly that: a task boosts
/// and restores itself while acquiring and releasing. The last priority that was set is kept
/// here and reported back without asking the kernel.
#[derive(Debug)]
pub struct FifoPriority {
    thread: ThreadId,
    current: AtomicU8,
}

impl FifoPriority {
    /// Puts the calling thread under `SCHED_FIFO` at `priority` and returns its control
    pub fn current(priority: Priority) -> io::Result<Self> {
        init_fifo_priority(priority)?;
        Ok(FifoPriority {
            thread: thread::current().id(),
            current: AtomicU8::new(priority),
        })
    }
}

impl PriorityControl for FifoPriority {
    fn priority(&self) -> Priority {
        self.current.load(Ordering::SeqCst)
    }

    fn set_priority(&self, priority: Priority) -> io::Result<()> {
        if thread::current().id() != self.thread {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "FIFO priority can only be changed from its own thread",
            ));
        }

        init_fifo_priority(priority)?;
        self.current.store(priority, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_from_other_thread_rejected() {
        let control = FifoPriority {
            thread: thread::current().id(),
            current: AtomicU8::new(3),
        };

        let err = thread::scope(|s| s.spawn(|| control.set_priority(5)).join().unwrap())
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert_eq!(control.priority(), 3);
    }
}
