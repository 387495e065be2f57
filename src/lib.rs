//! Priority Ceiling Protocol (PCP) resource arbiter for real-time Linux threads
//!
//! **IMPORTANT**: This crate is published as `linux-pcp` but the name of the library is `pcp`.
//!
//! Tasks share resources through an [`Arbiter`]. While a task holds a resource it runs at no
//! less than the resource's ceiling priority, the highest base priority of any task that uses
//! it, which bounds priority inversion to one critical section and rules out deadlock on a
//! uniprocessor fixed-priority scheduler.
//!
//! The scheduler is reached through [`PriorityControl`]. Enable the `rt` feature for
//! `SCHED_FIFO` threads, or use [`SimulatedPriority`] anywhere else.
//!
//! ```
//! use pcp::{Arbiter, ResourceId, ResourceRegistry, SimulatedPriority};
//!
//! const BUS: ResourceId = ResourceId::new("bus");
//!
//! let registry = ResourceRegistry::new().with(BUS, 4).unwrap();
//! let arbiter = Arbiter::new(registry);
//! let task = arbiter.register_task("sensor", SimulatedPriority::new(2));
//!
//! arbiter.acquire(BUS, task, None).unwrap();
//! assert_eq!(arbiter.priority(task).unwrap(), 4);
//! arbiter.release(BUS, task).unwrap();
//! assert_eq!(arbiter.priority(task).unwrap(), 2);
//! ```

pub use ctrlc;
pub use rtic_core::Mutex;
pub use tracing;

pub mod arbiter;
pub mod cell;
pub mod error;
pub mod event;
pub mod harness;
pub mod lock;
pub mod logging;
pub mod registry;
pub mod task;
#[cfg(feature = "rt")]
pub mod thread;
pub mod time;

pub use arbiter::Arbiter;
pub use cell::{ResourceCell, Shared};
pub use error::{ArbiterError, ConfigError, HarnessError};
pub use event::{ArbiterEvent, EventSink, MemorySink, TracingSink};
pub use registry::{Resource, ResourceId, ResourceRegistry};
pub use task::{PriorityControl, SimulatedPriority, TaskId};

/// Scheduling priority. A larger number is more urgent.
pub type Priority = u8;

