//! Four periodic tasks sharing three resources under the ceiling protocol.
//!
//! `cargo run --example periodic_tasks [cycles] [level]`. Runs until Ctrl-C when no cycle
//! count is given. `level` is the default log level, `info` if missing. Build with `--features rt` and run as root for real SCHED_FIFO priorities, all
//! tasks pinned to CPU 0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pcp::harness::{self, scenario, HarnessConfig};
use pcp::{logging, Arbiter, HarnessError};

fn main() -> Result<(), HarnessError> {
    let mut args = std::env::args().skip(1);
    let cycles = args.next().and_then(|arg| arg.parse().ok());
    let level = args
        .next()
        .and_then(|arg| logging::parse_level(&arg))
        .unwrap_or(tracing::Level::INFO);

    let _guard = logging::init(level);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(e) = pcp::ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
            tracing::warn!("cannot install Ctrl-C handler: {}", e);
        }
    }

    let arbiter = Arbiter::new(scenario::registry()?);
    let set = scenario::task_set(Duration::from_secs(2));
    let config = HarnessConfig {
        time_unit: Duration::from_millis(50),
        cycles,
        timeout: None,
    };

    #[cfg(feature = "rt")]
    let report = harness::run(&arbiter, &set, &config, &stop, |spec| {
        pcp::thread::pin_to_cpu(0)?;
        pcp::thread::FifoPriority::current(spec.priority)
    })?;

    #[cfg(not(feature = "rt"))]
    let report = harness::run(&arbiter, &set, &config, &stop, |spec| {
        Ok(pcp::SimulatedPriority::new(spec.priority))
    })?;

    for task in &report.tasks {
        tracing::info!(
            task = task.name,
            completed = task.completed,
            timeouts = task.timeouts,
            faults = task.faults,
            "done"
        );
    }

    Ok(())
}
