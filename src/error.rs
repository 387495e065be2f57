//! Error types returned by the arbiter and by startup validation

use std::io;
use std::time::Duration;

use crate::registry::ResourceId;
use crate::task::TaskId;
use crate::Priority;

/// Outcome of a failed [`Arbiter`](crate::Arbiter) operation.
///
/// `TimedOut` is recoverable and the caller decides what to do about it. `NotOwner`,
/// `OutOfOrder` and `Guarded` are faults in the calling sequence and nothing is mutated when
/// they are returned. `InvalidResource` and `UnknownTask` mean the system was misconfigured and should
/// have been caught by [`TaskSet::validate`](crate::harness::TaskSet::validate).
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    /// The resource mutex could not be taken within the wait bound.
    #[error("{task} timed out after {waited:?} waiting for resource {resource}")]
    TimedOut {
        resource: ResourceId,
        task: TaskId,
        waited: Duration,
    },

    /// Release of a free resource, or of a resource held by another task.
    #[error("{task} released resource {resource} which it does not own (owner: {owner:?})")]
    NotOwner {
        resource: ResourceId,
        task: TaskId,
        owner: Option<TaskId>,
    },

    /// The calling task already holds the resource. Acquisition is not reentrant.
    #[error("{task} already owns resource {resource}")]
    AlreadyOwned { resource: ResourceId, task: TaskId },

    /// Release that does not undo the caller's most recent acquisition.
    #[error("{task} released resource {resource} out of order, expected {expected}")]
    OutOfOrder {
        resource: ResourceId,
        task: TaskId,
        expected: ResourceId,
    },

    /// The resource is held by a [`ResourceCell`](crate::ResourceCell) closure and only the
    /// cell may give it back.
    #[error("{task} holds resource {resource} through a protected cell, release it there")]
    Guarded { resource: ResourceId, task: TaskId },

    #[error("resource {0} is not defined")]
    InvalidResource(ResourceId),

    #[error("{0} is not registered with this arbiter")]
    UnknownTask(TaskId),

    /// The scheduler refused a priority change. A failed boost leaves the arbiter as before the
    /// call. A failed restore happens after the resource was given back, so the resource is
    /// free and the task keeps its raised priority.
    #[error("failed to change priority of {task} to {priority}: {source}")]
    PriorityControl {
        task: TaskId,
        priority: Priority,
        #[source]
        source: io::Error,
    },
}

/// Static configuration problems detected before any task runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("resource {0} is defined twice")]
    DuplicateResource(ResourceId),

    #[error("task {0} is defined twice")]
    DuplicateTask(&'static str),

    #[error("task {task} uses resource {resource} which is not defined")]
    UndefinedResource {
        task: &'static str,
        resource: ResourceId,
    },

    /// A task with a base priority above the ceiling uses the resource, so holding it would
    /// not block every contender.
    #[error(
        "resource {resource} has ceiling {ceiling} but task {task} with priority {priority} uses it"
    )]
    CeilingTooLow {
        resource: ResourceId,
        ceiling: Priority,
        task: &'static str,
        priority: Priority,
    },

    #[error("task {task} has unbalanced acquire/release steps: {reason}")]
    UnbalancedSteps { task: &'static str, reason: String },

    #[error("task {task} computes for {units} time units, which does not fit a duration")]
    ComputeOverflow { task: &'static str, units: u32 },
}

/// Failure to start or finish a harness run
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid task set: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to set up priority control for task {task}: {source}")]
    PriorityControl {
        task: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("task {0} panicked")]
    TaskPanicked(&'static str),
}
