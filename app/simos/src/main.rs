// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use simkern::{Config, HaltReason, Policy, Report};

mod bridge;
mod demos;
mod ring;

#[derive(Debug, Parser)]
#[clap(
    max_term_width = 80,
    about = "boots the simulated kernel and runs one of the classic exercises"
)]
struct Args {
    /// Kernel debug output to turn on: any of `t` (threads and scheduling),
    /// `i` (interrupts and the timer), `s` (synchronization), or `+` (all).
    #[clap(short, long, default_value = "")]
    debug: String,

    /// Machine configuration file, in TOML. Flags override it.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Seeds the random number generator. This also turns on the timer,
    /// with randomized intervals.
    #[clap(long)]
    seed: Option<u64>,

    /// Ready-queue policy, `fifo` or `priority`.
    #[clap(long, parse(try_from_str = parse_policy))]
    policy: Option<Policy>,

    /// Installs the time-slicing timer.
    #[clap(long)]
    timer: bool,

    /// Prints the kernel's recent events after the run.
    #[clap(long)]
    trace: bool,

    #[clap(subcommand)]
    demo: Demo,
}

#[derive(Debug, Subcommand)]
enum Demo {
    /// Main and three forked threads taking turns with `yield`
    Threads,
    /// Threads at priorities 1, 2 and 3 (implies `--policy priority`)
    Priority,
    /// Cars crossing a one-lane bridge, with a lock and a Mesa condition
    Bridge {
        #[clap(long, default_value_t = 7)]
        cars: usize,
    },
    /// Producers and consumers sharing a ring buffer, with semaphores
    Prodcons,
    /// The same ring buffer, as a Hoare monitor
    Ring,
    /// Threads meeting at a barrier after burning simulated time
    Barrier {
        #[clap(long, default_value_t = 10)]
        threads: usize,
    },
    /// Workers taking jobs off a SynchList
    Synchlist,
    /// Simulated devices finishing at staggered times
    Clock,
}

fn parse_policy(s: &str) -> Result<Policy, String> {
    match s {
        "fifo" => Ok(Policy::Fifo),
        "priority" => Ok(Policy::Priority),
        _ => Err(format!("unknown policy `{s}` (want `fifo` or `priority`)")),
    }
}

/// Maps debug flags to the kernel log targets they turn on.
fn debug_targets(flags: &str) -> Result<Vec<&'static str>> {
    let mut targets = vec![];
    for flag in flags.chars() {
        let these: &[&'static str] = match flag {
            't' => &["simkern::thread", "simkern::sched"],
            'i' => &["simkern::interrupt", "simkern::timer"],
            's' => &["simkern::synch", "simkern::monitor", "simkern::synchlist"],
            '+' => &["simkern"],
            _ => bail!("unknown debug flag `{flag}`"),
        };
        targets.extend_from_slice(these);
    }
    Ok(targets)
}

fn init_logging(flags: &str) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn"),
    );
    for target in debug_targets(flags)? {
        builder.filter_module(target, LevelFilter::Trace);
    }
    builder.init();
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Config::from_toml(&text)
                .with_context(|| format!("bad config in {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(seed) = args.seed {
        config.random_seed = Some(seed);
        config.timer = true;
    }
    if args.timer {
        config.timer = true;
    }
    match (args.policy, &args.demo) {
        (Some(policy), _) => config.policy = policy,
        (None, Demo::Priority) => config.policy = Policy::Priority,
        (None, _) => (),
    }
    config.validate()?;
    Ok(config)
}

fn run(demo: Demo, config: Config) -> Result<Report> {
    let report = match demo {
        Demo::Threads => simkern::run(config, demos::threads),
        Demo::Priority => simkern::run(config, demos::priority),
        Demo::Bridge { cars } => {
            simkern::run(config, move |k| bridge::traffic(k, cars))
        }
        Demo::Prodcons => simkern::run(config, ring::prodcons),
        Demo::Ring => simkern::run(config, ring::monitor),
        Demo::Barrier { threads } => {
            simkern::run(config, move |k| demos::barrier(k, threads))
        }
        Demo::Synchlist => simkern::run(config, demos::synchlist),
        Demo::Clock => simkern::run(config, demos::clock),
    };
    Ok(report?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.debug)?;

    let config = load_config(&args)?;
    log::debug!("{config:?}");
    let trace = args.trace;
    let report = run(args.demo, config).context("simulation failed")?;

    if report.reason == HaltReason::Idle {
        println!("No threads ready or runnable, and no pending interrupts.");
        println!("Assuming the program completed.");
    }
    println!("Machine halting!\n");
    println!("{}", report.stats);

    if trace {
        println!("\nRecent kernel events, oldest first:");
        for e in &report.trace {
            println!("  line {:>4} x{:<3} {:?}", e.line, e.count, e.payload);
        }
    }
    Ok(())
}
