//! Two threads updating a value guarded by a ceiling resource through the `Mutex` trait.

use std::thread;

use pcp::Mutex as _;
use pcp::{logging, Arbiter, ResourceId, ResourceRegistry, SimulatedPriority};

const LOG: ResourceId = ResourceId::new("log");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = logging::init(tracing::Level::INFO);

    let arbiter = Arbiter::new(ResourceRegistry::new().with(LOG, 3)?);
    let lines = arbiter.protect(LOG, Vec::<String>::new())?;

    thread::scope(|s| {
        for (name, prio) in [("logger", 1), ("sampler", 3)] {
            let arbiter = &arbiter;
            let lines = &lines;
            s.spawn(move || {
                let task = arbiter.register_task(name, SimulatedPriority::new(prio));
                let mut shared = lines.access(task);
                for i in 0..3 {
                    shared.lock(|lines| lines.push(format!("{} #{}", name, i)));
                }
            });
        }
    });

    for line in lines.into_inner() {
        println!("{}", line);
    }

    Ok(())
}
