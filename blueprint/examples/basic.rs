//! Wires a consumer to a clock service that shows up after start.
//!
//! Run with `RUST_LOG=blueprint_container=debug cargo run --example basic`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blueprint::prelude::*;
use tracing_subscriber::EnvFilter;

struct Clock {
    tick: u64,
}

struct Reporter {
    clock: Arc<ServiceProxy>,
}

impl Reporter {
    fn report(&self) -> Result<u64> {
        Ok(self.clock.require::<Clock>()?.tick)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Arc::new(InMemoryRegistry::new());
    let container = BlueprintContainer::builder("reporting")
        .recipe(ReferenceRecipe::new(
            "clock",
            ReferenceMetadata::new()
                .interface("Clock")
                .timeout(Duration::from_secs(5)),
            registry.clone(),
        )?)
        .recipe(
            BeanRecipe::new(|args| Ok(Reporter { clock: args.get::<ServiceProxy>(0)? }))
                .named("reporter")
                .argument(Arc::new(RefRecipe::new("clock"))),
        )
        .build()?;

    let publisher = thread::spawn({
        let registry = registry.clone();
        move || {
            thread::sleep(Duration::from_millis(200));
            registry.register(
                vec!["Clock".into()],
                ServiceProperties::new(),
                Arc::new(Clock { tick: 42 }),
            )
        }
    });

    container.start()?;
    let reporter = container.component_instance_as::<Reporter>("reporter")?;
    println!("tick = {}", reporter.report()?);

    publisher
        .join()
        .map_err(|_| BlueprintError::definition("publisher thread panicked"))??;
    container.destroy();
    Ok(())
}
