//! Periodic task set driving the arbiter
//!
//! Each task runs on its own thread. It is released at `start + offset` and then once per
//! period, and every release walks through its fixed list of steps: spin for some time units,
//! acquire a resource, release a resource.
//!
//! Released tasks share one simulated CPU. Only the ready task with the highest effective
//! priority executes its steps, and it is preempted between steps and compute slices as soon as
//! a strictly more urgent task becomes ready. That is the fixed-priority uniprocessor the ceiling
//! protocol is defined for, so the run stays deadlock free even when the threads themselves are
//! spread over several cores.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::arbiter::Arbiter;
use crate::error::{ArbiterError, ConfigError, HarnessError};
use crate::registry::{ResourceId, ResourceRegistry};
use crate::task::{PriorityControl, TaskId};
use crate::time::{self, Duration, Instant};
use crate::Priority;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Busy for this many time units
    Compute(u32),
    Acquire(ResourceId),
    Release(ResourceId),
}

/// Static description of one periodic task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: &'static str,
    pub priority: Priority,
    pub period: Duration,
    pub offset: Duration,
    pub steps: Vec<Step>,
}

impl TaskSpec {
    pub fn new(name: &'static str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            period: Duration::from_secs(1),
            offset: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Delay of the first release
    pub fn offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    pub fn compute(mut self, units: u32) -> Self {
        self.steps.push(Step::Compute(units));
        self
    }

    pub fn acquire(mut self, resource: ResourceId) -> Self {
        self.steps.push(Step::Acquire(resource));
        self
    }

    pub fn release(mut self, resource: ResourceId) -> Self {
        self.steps.push(Step::Release(resource));
        self
    }

    fn check_nesting(&self) -> Result<(), ConfigError> {
        let unbalanced = |reason: String| ConfigError::UnbalancedSteps {
            task: self.name,
            reason,
        };

        let mut held: Vec<ResourceId> = Vec::new();
        for step in &self.steps {
            match *step {
                Step::Compute(_) => {}
                Step::Acquire(res) => {
                    if held.contains(&res) {
                        return Err(unbalanced(format!("acquires {} twice", res)));
                    }
                    held.push(res);
                }
                Step::Release(res) => match held.last() {
                    Some(&last) if last == res => {
                        held.pop();
                    }
                    Some(&last) if held.contains(&res) => {
                        return Err(unbalanced(format!(
                            "releases {} while {} is still held",
                            res, last
                        )));
                    }
                    _ => return Err(unbalanced(format!("releases {} without holding it", res))),
                },
            }
        }

        match held.last() {
            Some(res) => Err(unbalanced(format!("ends its cycle holding {}", res))),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskSpec>,
}

impl TaskSet {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Highest base priority among the users of each resource
    pub fn ceilings(&self) -> BTreeMap<ResourceId, Priority> {
        let mut ceilings = BTreeMap::new();
        for task in &self.tasks {
            for step in &task.steps {
                if let Step::Acquire(res) = *step {
                    let ceiling = ceilings.entry(res).or_insert(task.priority);
                    *ceiling = (*ceiling).max(task.priority);
                }
            }
        }
        ceilings
    }

    /// Startup validation of the task set against the resources it will run with
    pub fn validate(&self, registry: &ResourceRegistry) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name) {
                return Err(ConfigError::DuplicateTask(task.name));
            }

            for step in &task.steps {
                let res = match *step {
                    Step::Acquire(res) | Step::Release(res) => res,
                    Step::Compute(_) => continue,
                };

                let ceiling = registry
                    .ceiling(res)
                    .map_err(|_| ConfigError::UndefinedResource {
                        task: task.name,
                        resource: res,
                    })?;

                if ceiling < task.priority {
                    return Err(ConfigError::CeilingTooLow {
                        resource: res,
                        ceiling,
                        task: task.name,
                        priority: task.priority,
                    });
                }
            }

            task.check_nesting()?;
        }

        Ok(())
    }
}

impl ResourceRegistry {
    /// Defines every resource used by `set` with the lowest valid ceiling
    pub fn from_task_set(set: &TaskSet) -> Result<Self, ConfigError> {
        let mut registry = ResourceRegistry::new();
        for (res, ceiling) in set.ceilings() {
            registry.define(res, ceiling)?;
        }
        Ok(registry)
    }
}

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Length of one compute unit
    pub time_unit: Duration,
    /// Releases per task, `None` runs until stopped
    pub cycles: Option<u32>,
    /// Wait bound of every acquire step, `None` waits forever
    pub timeout: Option<Duration>,
}

impl HarnessConfig {
    /// Checks that every compute step of `set` has a representable length
    pub fn validate(&self, set: &TaskSet) -> Result<(), ConfigError> {
        for task in set.tasks() {
            for step in &task.steps {
                if let Step::Compute(units) = *step {
                    if self.time_unit.checked_mul(units).is_none() {
                        return Err(ConfigError::ComputeOverflow {
                            task: task.name,
                            units,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_millis(10),
            cycles: Some(1),
            timeout: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub name: &'static str,
    /// Releases that ran to the end of their step list
    pub completed: u32,
    pub timeouts: u32,
    pub faults: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn faults(&self) -> u32 {
        self.tasks.iter().map(|t| t.faults).sum()
    }

    pub fn timeouts(&self) -> u32 {
        self.tasks.iter().map(|t| t.timeouts).sum()
    }
}

/// Runs `set` on `arbiter` until every task did `config.cycles` releases or `stop` is set.
///
/// `control` is called on each task thread before its first release and provides the
/// priority control the task registers with.
pub fn run<F, P>(
    arbiter: &Arbiter,
    set: &TaskSet,
    config: &HarnessConfig,
    stop: &AtomicBool,
    control: F,
) -> Result<RunReport, HarnessError>
where
    F: Fn(&TaskSpec) -> io::Result<P> + Sync,
    P: PriorityControl + 'static,
{
    set.validate(arbiter.registry())?;
    config.validate(set)?;

    let start = Instant::now();
    let control = &control;
    let dispatcher = &Dispatcher::new(arbiter);

    let results = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = set
            .tasks()
            .iter()
            .map(|spec| {
                let handle = s.spawn(move |_| {
                    let prio = control(spec).map_err(|source| HarnessError::PriorityControl {
                        task: spec.name,
                        source,
                    })?;
                    let task = arbiter.register_task(spec.name, prio);
                    Ok(run_task(dispatcher, task, spec, config, stop, start))
                });
                (spec.name, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(name, handle)| {
                handle
                    .join()
                    .map_err(|_| HarnessError::TaskPanicked(name))
                    .and_then(|r| r)
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .map_err(|_| HarnessError::TaskPanicked("harness"))?;

    Ok(RunReport { tasks: results? })
}

/// Length of the busy slices between two preemption points of a compute step
const COMPUTE_SLICE: Duration = Duration::from_micros(500);

/// Simulated uniprocessor shared by the tasks of one run
struct Dispatcher<'a> {
    arbiter: &'a Arbiter,
    cpu: Mutex<Cpu>,
    switched: Condvar,
}

#[derive(Default)]
struct Cpu {
    running: Option<TaskId>,
    // Released tasks with the order they became ready in
    ready: Vec<(u64, TaskId)>,
    next_seq: u64,
}

impl<'a> Dispatcher<'a> {
    fn new(arbiter: &'a Arbiter) -> Self {
        Self {
            arbiter,
            cpu: Mutex::new(Cpu::default()),
            switched: Condvar::new(),
        }
    }

    fn priority(&self, task: TaskId) -> Priority {
        self.arbiter.priority(task).unwrap_or_default()
    }

    /// Most urgent ready task, earliest arrival first among equals
    fn pick(&self, cpu: &Cpu) -> Option<TaskId> {
        cpu.ready
            .iter()
            .max_by_key(|&&(seq, task)| (self.priority(task), Reverse(seq)))
            .map(|&(_, task)| task)
    }

    /// Makes `task` ready and waits until it is dispatched
    fn run(&self, task: TaskId) -> Running<'_, 'a> {
        self.enter(task);
        Running {
            dispatcher: self,
            task,
        }
    }

    fn enter(&self, task: TaskId) {
        let mut cpu = self.cpu.lock();
        let seq = cpu.next_seq;
        cpu.next_seq += 1;
        cpu.ready.push((seq, task));

        if cpu.running.is_none() {
            cpu.running = self.pick(&cpu);
            self.switched.notify_all();
        }
        while cpu.running != Some(task) {
            self.switched.wait(&mut cpu);
        }
    }

    fn exit(&self, task: TaskId) {
        let mut cpu = self.cpu.lock();
        cpu.ready.retain(|&(_, t)| t != task);

        if cpu.running == Some(task) {
            cpu.running = self.pick(&cpu);
            self.switched.notify_all();
        }
    }
}

/// The CPU as held by one task, given up again on drop
struct Running<'d, 'a> {
    dispatcher: &'d Dispatcher<'a>,
    task: TaskId,
}

impl Running<'_, '_> {
    /// Preemption point: lets a strictly more urgent ready task run first
    fn yield_now(&self) {
        let dispatcher = self.dispatcher;
        let mut cpu = dispatcher.cpu.lock();

        let next = match dispatcher.pick(&cpu) {
            Some(next) if next != self.task => next,
            _ => return,
        };
        if dispatcher.priority(next) <= dispatcher.priority(self.task) {
            return;
        }

        tracing::trace!(to = %next, "preempted");
        cpu.running = Some(next);
        dispatcher.switched.notify_all();
        while cpu.running != Some(self.task) {
            dispatcher.switched.wait(&mut cpu);
        }
    }

    /// Leaves the CPU to the others while `f` blocks
    fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.dispatcher.exit(self.task);
        let r = f();
        self.dispatcher.enter(self.task);
        r
    }
}

impl Drop for Running<'_, '_> {
    fn drop(&mut self) {
        self.dispatcher.exit(self.task);
    }
}

fn run_task(
    dispatcher: &Dispatcher<'_>,
    task: TaskId,
    spec: &TaskSpec,
    config: &HarnessConfig,
    stop: &AtomicBool,
    start: Instant,
) -> TaskReport {
    let span = tracing::info_span!("task", name = spec.name);
    let _enter = span.enter();

    let mut report = TaskReport {
        name: spec.name,
        ..Default::default()
    };
    let mut release = start + spec.offset;

    for cycle in 0.. {
        if config.cycles.map_or(false, |n| cycle >= n) {
            break;
        }

        time::delay_until(release);
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let cpu = dispatcher.run(task);
        tracing::trace!(cycle, "released");
        if run_cycle(dispatcher.arbiter, &cpu, spec, config, &mut report) {
            report.completed += 1;
        }
        drop(cpu);

        release = release + spec.period;
    }

    report
}

/// Returns `false` if the cycle was cut short
fn run_cycle(
    arbiter: &Arbiter,
    cpu: &Running<'_, '_>,
    spec: &TaskSpec,
    config: &HarnessConfig,
    report: &mut TaskReport,
) -> bool {
    let task = cpu.task;
    let mut held: Vec<ResourceId> = Vec::new();

    for step in &spec.steps {
        let result = match *step {
            Step::Compute(units) => {
                compute(cpu, config.time_unit.saturating_mul(units));
                Ok(())
            }
            Step::Acquire(res) => {
                acquire(arbiter, cpu, res, config.timeout).map(|()| held.push(res))
            }
            Step::Release(res) => {
                let result = arbiter.release(res, task);
                // A failed restore still frees the resource
                if matches!(result, Ok(()) | Err(ArbiterError::PriorityControl { .. })) {
                    held.pop();
                }
                result
            }
        };

        if let Err(e) = result {
            match e {
                ArbiterError::TimedOut { .. } => {
                    tracing::warn!("{}, abandoning cycle", e);
                    report.timeouts += 1;
                }
                _ => {
                    tracing::error!("{}, abandoning cycle", e);
                    report.faults += 1;
                }
            }
            abandon(arbiter, task, &mut held, report);
            return false;
        }

        cpu.yield_now();
    }

    // Everything was released, so the task must be back at its base priority
    match (arbiter.priority(task), arbiter.base_priority(task)) {
        (Ok(priority), Ok(base)) if priority != base => {
            tracing::error!(priority, base, "cycle ended above base priority");
            report.faults += 1;
            false
        }
        _ => true,
    }
}

/// Spins for `budget` of CPU time, with a preemption point after every slice
fn compute(cpu: &Running<'_, '_>, budget: Duration) {
    let mut left = budget;
    while !left.is_zero() {
        let slice = left.min(COMPUTE_SLICE);
        time::spin_for(slice);
        left -= slice;
        cpu.yield_now();
    }
}

/// Takes `res` right away if it is free, otherwise blocks off the CPU for at most `timeout`
fn acquire(
    arbiter: &Arbiter,
    cpu: &Running<'_, '_>,
    res: ResourceId,
    timeout: Option<Duration>,
) -> Result<(), ArbiterError> {
    match arbiter.acquire(res, cpu.task, Some(Duration::ZERO)) {
        Err(ArbiterError::TimedOut { .. }) if timeout != Some(Duration::ZERO) => {
            tracing::debug!(resource = res.name(), "blocked");
            cpu.suspend(|| arbiter.acquire(res, cpu.task, timeout))
        }
        other => other,
    }
}

fn abandon(arbiter: &Arbiter, task: TaskId, held: &mut Vec<ResourceId>, report: &mut TaskReport) {
    while let Some(res) = held.pop() {
        if let Err(e) = arbiter.release(res, task) {
            tracing::error!("cleanup release failed: {}", e);
            report.faults += 1;
        }
    }
}

/// Four tasks contending for three resources
pub mod scenario {
    use super::*;

    pub const A: ResourceId = ResourceId::new("A");
    pub const B: ResourceId = ResourceId::new("B");
    pub const C: ResourceId = ResourceId::new("C");

    pub fn registry() -> Result<ResourceRegistry, ConfigError> {
        ResourceRegistry::new().with(A, 4)?.with(B, 5)?.with(C, 5)
    }

    pub fn task_set(period: Duration) -> TaskSet {
        let ms = Duration::from_millis;

        TaskSet::new(vec![
            TaskSpec::new("Task1", 5)
                .period(period)
                .offset(ms(10))
                .compute(1)
                .acquire(B)
                .compute(1)
                .release(B)
                .compute(1)
                .acquire(C)
                .compute(1)
                .release(C)
                .compute(1),
            TaskSpec::new("Task2", 4)
                .period(period)
                .offset(ms(3))
                .compute(1)
                .acquire(C)
                .compute(2)
                .release(C)
                .compute(2)
                .acquire(A)
                .compute(1)
                .release(A)
                .compute(1),
            TaskSpec::new("Task3", 3)
                .period(period)
                .offset(ms(5))
                .compute(2)
                .acquire(B)
                .compute(1)
                .acquire(A)
                .compute(2)
                .release(A)
                .compute(2)
                .release(B)
                .compute(1),
            TaskSpec::new("Task4", 2)
                .period(period)
                .compute(2)
                .acquire(A)
                .compute(2)
                .acquire(B)
                .compute(2)
                .release(B)
                .compute(2)
                .release(A)
                .compute(1),
        ])
    }
}
