//! skyrt - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use skyrt::runtime::gc::{GCOptimizer, GarbageCollector, TypeInfo};
use skyrt::runtime::scheduler::{Scheduler, Task};
use skyrt::util::config::RuntimeConfig;
use skyrt::util::logger::{self, LogLevel};
use skyrt::{NAME, VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inspect and exercise the skyrt runtime
#[derive(Parser, Debug)]
#[command(name = "skyrt")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective runtime configuration as TOML
    Config,

    /// Allocate objects, run one collection and print GC and optimizer statistics as JSON
    Gc {
        /// Number of objects to allocate
        #[arg(long, default_value_t = 1000)]
        objects: usize,

        /// Payload size of each object in bytes
        #[arg(long, default_value_t = 64)]
        size: usize,

        /// How many of the objects stay rooted
        #[arg(long, default_value_t = 10)]
        rooted: usize,
    },

    /// Schedule tasks with the given delays and print the dispatch order
    Sched {
        /// Delays in milliseconds, one task per delay
        #[arg(value_name = "MS", default_values_t = [30u64, 10, 20])]
        delays: Vec<u64>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = RuntimeConfig::load().context("Failed to load configuration")?;

    let level = match args.log {
        Some(level) => level,
        None => config.log_level()?,
    };
    logger::try_init_with_level(level);

    match args.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Gc {
            objects,
            size,
            rooted,
        } => run_gc(&config, objects, size, rooted)?,
        Commands::Sched { delays } => run_sched(&config, &delays)?,
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn run_gc(
    config: &RuntimeConfig,
    objects: usize,
    size: usize,
    rooted: usize,
) -> Result<()> {
    let mut gc_config = config.gc.to_gc_config();
    gc_config.background = false;
    let optimizer = GCOptimizer::new(gc_config.max_pause);
    let gc = GarbageCollector::new(gc_config);
    let ty = Arc::new(TypeInfo::new("blob", size));

    for i in 0..objects {
        let ptr = gc
            .try_alloc(size, &ty)
            .with_context(|| format!("allocation {} of {} failed", i + 1, objects))?;
        if i < rooted {
            gc.add_root(ptr);
        }
    }
    let before = gc.stats();
    gc.collect();
    optimizer.optimize(&gc);
    let after = gc.stats();

    let report = serde_json::json!({
        "before": before,
        "after": after,
        "reclaimed": before.heap_used.saturating_sub(after.heap_used),
        "optimizer": optimizer.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_sched(
    config: &RuntimeConfig,
    delays: &[u64],
) -> Result<()> {
    let scheduler = Scheduler::new(config.scheduler.to_scheduler_config());
    scheduler.start().context("Failed to start scheduler")?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();
    let mut tasks = Vec::with_capacity(delays.len());
    for (index, &delay) in delays.iter().enumerate() {
        let order = order.clone();
        let task = Task::named(format!("delay-{}ms", delay), move |_| {
            order.lock().push(index);
            Ok(delay)
        });
        scheduler.schedule_at(&task, 0, base + Duration::from_millis(delay))?;
        tasks.push(task);
    }
    for task in &tasks {
        task.await_result()?;
    }

    for index in order.lock().iter() {
        println!("{} after {}ms", tasks[*index].id(), delays[*index]);
    }
    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
    scheduler.stop();
    Ok(())
}
