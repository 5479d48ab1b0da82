//! Leakwatch Demo Binary
//!
//! Run with: `leakwatch-demo [SCENARIO] [--json]`
//!
//! Each scenario builds a small object graph on the real heap under the
//! leakwatch allocator, then runs a leak check and prints what it found.

use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use leakwatch_runtime::{DetectorConfig, LeakCheckAllocator, LeakPolicy, LeakReport};

#[global_allocator]
static GLOBAL: LeakCheckAllocator = LeakCheckAllocator::new();

/// Tag attached to every allocation a scenario makes.
const DEMO_TAG: &str = "demo";

/// Keeps the `reachable` scenario's list alive.
static ROOT: AtomicPtr<Node> = AtomicPtr::new(ptr::null_mut());

#[derive(Parser)]
#[command(name = "leakwatch-demo")]
#[command(about = "Run canned leak scenarios under the leakwatch allocator")]
#[command(version)]
struct Cli {
    /// Scenario to run
    #[arg(value_enum, default_value_t = Scenario::Indirect)]
    scenario: Scenario,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Suppression file
    #[arg(short, long)]
    suppressions: Option<PathBuf>,

    /// Leave reporting to the exit-time check
    #[arg(long)]
    at_exit: bool,

    /// Exit with the configured code when leaks are found
    #[arg(long)]
    fail: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// One unreferenced node
    Direct,
    /// An unreferenced node pointing at a second node
    Indirect,
    /// Two nodes pointing at each other
    Cycle,
    /// A list rooted in a global
    Reachable,
    /// An unreferenced node exempted with `ignore_object`
    Ignored,
}

struct Node {
    next: *mut Node,
    payload: [u64; 4],
}

fn node(value: u64) -> *mut Node {
    Box::into_raw(Box::new(Node {
        next: ptr::null_mut(),
        payload: [value; 4],
    }))
}

#[inline(never)]
fn build(scenario: Scenario) -> Result<()> {
    let _tag = leakwatch_runtime::tag_scope(DEMO_TAG);
    match scenario {
        Scenario::Direct => {
            node(1);
        }
        Scenario::Indirect => {
            let head = node(1);
            // SAFETY: head was just allocated and is not shared.
            unsafe { (*head).next = node(2) };
        }
        Scenario::Cycle => {
            let a = node(1);
            let b = node(2);
            // SAFETY: both nodes were just allocated and are not shared.
            unsafe {
                (*a).next = b;
                (*b).next = a;
            }
        }
        Scenario::Reachable => {
            let mut head = ptr::null_mut();
            for value in 0..4 {
                let next = node(value);
                // SAFETY: next was just allocated and is not shared.
                unsafe { (*next).next = head };
                head = next;
            }
            ROOT.store(head, Ordering::SeqCst);

            let mut total = 0;
            let mut cursor = head;
            while !cursor.is_null() {
                // SAFETY: every node in the list is live and owned by ROOT.
                let current = unsafe { &*cursor };
                total += current.payload.iter().sum::<u64>();
                cursor = current.next;
            }
            debug!(total, "rooted list built");
        }
        Scenario::Ignored => {
            let lonely = node(7);
            leakwatch_runtime::ignore_object(lonely as *const Node)
                .context("failed to ignore the demo node")?;
        }
    }
    Ok(())
}

/// Keep only the scenario's own allocations.
fn demo_only(mut report: LeakReport) -> LeakReport {
    report
        .entries
        .retain(|entry| entry.tags.iter().any(|tag| tag.as_str() == DEMO_TAG));
    report.total_leaked_bytes = report.entries.iter().map(|entry| entry.total_bytes).sum();
    report.total_leaked_objects = report.entries.iter().map(|entry| entry.object_count).sum();
    report
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = DetectorConfig::from_env();
    config.leak_check_at_exit = cli.at_exit;
    config.report.policy = if cli.fail {
        LeakPolicy::Fail
    } else {
        LeakPolicy::ReportOnly
    };
    if let Some(path) = &cli.suppressions {
        config.report.suppressions = Some(path.clone());
    }
    let exitcode = config.report.exitcode;
    let detector = leakwatch_runtime::init_with(config).context("failed to initialize leakwatch")?;
    info!(scenario = ?cli.scenario, "running scenario");

    build(cli.scenario)?;
    debug!(live = detector.chunks().len(), "scenario built");

    if cli.at_exit {
        // The exit-time check reports everything still unreachable.
        return Ok(());
    }

    let report = demo_only(leakwatch_runtime::check_leaks().context("leak check failed")?);
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize the report")?
        );
    } else if report.has_leaks() {
        print!("{}", report);
    } else {
        println!("no leaks in scenario {:?}", cli.scenario);
    }

    if cli.fail && report.has_leaks() {
        std::process::exit(exitcode);
    }
    Ok(())
}
